mod common;

use common::{harness, nequi_request, webhook};
use paysync::application::monitor::{MonitorConfig, ReconciliationMonitor};
use paysync::application::service::ReconcileOutcome;
use paysync::domain::gateway::GatewayStatus;
use paysync::domain::payment::PaymentStatus;
use paysync::infrastructure::sandbox::SandboxGateway;
use std::sync::Arc;
use std::time::Duration;

fn monitor(service: &Arc<paysync::application::service::UnifiedPaymentService>) -> ReconciliationMonitor {
    ReconciliationMonitor::new(
        Arc::clone(service),
        MonitorConfig {
            poll_interval: Duration::from_secs(5),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_no_polls_after_confirmation() {
    let h = harness(SandboxGateway::new().with_status_script([
        GatewayStatus::Pending,
        GatewayStatus::Approved,
    ]));
    h.service.process_payment(nequi_request("order-1")).await;
    let monitor = monitor(&h.service);

    let handle = monitor.watch("order-1");
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        h.service.get_state("order-1").await.unwrap().status,
        PaymentStatus::Confirmed
    );
    let calls = h.gateway.status_calls();
    assert_eq!(calls, 2);

    // Several more ticks' worth of time.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.gateway.status_calls(), calls);
    assert!(handle.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_no_polls_after_error() {
    let h = harness(
        SandboxGateway::new()
            .with_status_script([GatewayStatus::Pending])
            .then_status(GatewayStatus::Declined, "Fondos insuficientes"),
    );
    h.service.process_payment(nequi_request("order-1")).await;
    let monitor = monitor(&h.service);

    monitor.watch("order-1");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.gateway.status_calls(), 2);
    let state = h.service.get_state("order-1").await.unwrap();
    assert_eq!(state.status, PaymentStatus::Error);
    assert_eq!(state.error.as_deref(), Some("Fondos insuficientes"));
}

#[tokio::test(start_paused = true)]
async fn test_webhook_settles_order_and_polling_ends() {
    let h = harness(SandboxGateway::new());
    let result = h.service.process_payment(nequi_request("order-1")).await;
    let transaction_id = result.state.unwrap().transaction_id.unwrap();
    let monitor = monitor(&h.service);

    let handle = monitor.watch("order-1");
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.gateway.status_calls(), 1);

    h.service
        .handle_webhook(webhook("order-1", &transaction_id, GatewayStatus::Approved))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.gateway.status_calls(), 1);
    assert!(handle.is_stopped());
    assert!(!monitor.is_watching("order-1"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_future_polls() {
    let h = harness(SandboxGateway::new());
    h.service.process_payment(nequi_request("order-1")).await;
    let monitor = monitor(&h.service);

    let handle = monitor.watch("order-1");
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(h.gateway.status_calls(), 3);

    handle.stop();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.gateway.status_calls(), 3);
    assert_eq!(
        h.service.get_state("order-1").await.unwrap().status,
        PaymentStatus::Pending
    );

    // A later watch starts a fresh task.
    let again = monitor.watch("order-1");
    assert!(!again.is_stopped());
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.gateway.status_calls(), 4);
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_keep_polling() {
    let h = harness(
        SandboxGateway::new()
            .with_status_script([GatewayStatus::Approved])
            .with_transient_failures(2),
    );
    h.service.process_payment(nequi_request("order-1")).await;
    let monitor = monitor(&h.service);

    monitor.watch("order-1");
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.gateway.status_calls(), 3);
    assert_eq!(
        h.service.get_state("order-1").await.unwrap().status,
        PaymentStatus::Confirmed
    );
}

#[tokio::test(start_paused = true)]
async fn test_force_check_and_resume() {
    let h = harness(SandboxGateway::new().with_status_script([GatewayStatus::Approved]));
    h.service.process_payment(nequi_request("order-1")).await;
    h.service.process_payment(nequi_request("order-2")).await;
    let monitor = monitor(&h.service);

    let outcome = monitor.force_check("order-1").await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Transitioned { .. }));

    let handles = monitor.resume_all().await;
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].order_id(), "order-2");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(
        h.service.get_state("order-2").await.unwrap().status,
        PaymentStatus::Confirmed
    );
    assert_eq!(monitor.active_count(), 0);
}
