//! Background polling that drives non-terminal payments to a final status.

use super::service::{ReconcileOutcome, UnifiedPaymentService};
use crate::error::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

struct WatchEntry {
    generation: u64,
    token: CancellationToken,
}

/// Handle to an order's polling task.
///
/// Dropping the handle does not stop the task.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    order_id: String,
    token: CancellationToken,
}

impl MonitorHandle {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// Stops polling. A status check already in flight still completes and
    /// its result is applied; no check starts afterwards.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// True once the task was stopped or ended on a terminal status.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Owns one polling task per watched order.
pub struct ReconciliationMonitor {
    service: Arc<UnifiedPaymentService>,
    config: MonitorConfig,
    tasks: Arc<DashMap<String, WatchEntry>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl ReconciliationMonitor {
    pub fn new(service: Arc<UnifiedPaymentService>, config: MonitorConfig) -> Self {
        Self {
            service,
            config,
            tasks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts polling `order_id`, or returns the handle of the task already
    /// doing so.
    pub fn watch(&self, order_id: &str) -> MonitorHandle {
        let order_id = order_id.to_string();
        match self.tasks.entry(order_id.clone()) {
            Entry::Occupied(entry) if !entry.get().token.is_cancelled() => MonitorHandle {
                order_id,
                token: entry.get().token.clone(),
            },
            entry => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let token = self.shutdown.child_token();
                let watch = WatchEntry {
                    generation,
                    token: token.clone(),
                };
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(watch);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(watch);
                    }
                }

                tokio::spawn(poll_loop(
                    Arc::clone(&self.service),
                    order_id.clone(),
                    self.config.poll_interval,
                    token.clone(),
                    Arc::clone(&self.tasks),
                    generation,
                ));
                MonitorHandle { order_id, token }
            }
        }
    }

    /// Starts watching every stored state that still awaits a final status.
    pub async fn resume_all(&self) -> Vec<MonitorHandle> {
        let mut handles = Vec::new();
        for state in self.service.store().states().await {
            if !state.status.is_terminal() {
                handles.push(self.watch(&state.order_id));
            }
        }
        if !handles.is_empty() {
            tracing::info!(count = handles.len(), "Resumed payment monitoring");
        }
        handles
    }

    /// Checks an order right away, serialized with the timer-driven checks.
    pub async fn force_check(&self, order_id: &str) -> Result<ReconcileOutcome> {
        self.service.check_and_update_payment_status(order_id).await
    }

    pub fn is_watching(&self, order_id: &str) -> bool {
        self.tasks
            .get(order_id)
            .is_some_and(|entry| !entry.token.is_cancelled())
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.token.is_cancelled())
            .count()
    }

    /// Stops every polling task.
    pub fn shutdown(&self) {
        tracing::info!(active = self.active_count(), "Stopping payment monitor");
        self.shutdown.cancel();
    }
}

impl Drop for ReconciliationMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_loop(
    service: Arc<UnifiedPaymentService>,
    order_id: String,
    period: Duration,
    token: CancellationToken,
    tasks: Arc<DashMap<String, WatchEntry>>,
    generation: u64,
) {
    tracing::debug!(order_id = %order_id, ?period, "Payment monitor started");
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Outside the select so a stop never abandons a check mid-flight.
        if !poll_once(&service, &order_id).await {
            break;
        }
    }

    token.cancel();
    tasks.remove_if(&order_id, |_, entry| entry.generation == generation);
    tracing::debug!(order_id = %order_id, "Payment monitor stopped");
}

/// Returns whether polling should continue.
async fn poll_once(service: &UnifiedPaymentService, order_id: &str) -> bool {
    let Some(state) = service.get_state(order_id).await else {
        tracing::warn!(order_id, "Monitored order has no payment state");
        return false;
    };
    if state.status.is_terminal() {
        return false;
    }
    if !state.needs_reconciliation() {
        // Nothing to ask the gateway about until a transaction id shows up.
        return true;
    }

    match service.check_and_update_payment_status(order_id).await {
        Ok(outcome) => {
            if let ReconcileOutcome::Transitioned { from, to } = &outcome {
                tracing::info!(order_id, %from, %to, "Payment status reconciled");
            }
            !outcome.is_terminal()
        }
        Err(e) => {
            tracing::warn!(order_id, error = %e, "Stopping payment monitor");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::store::PaymentStateStore;
    use crate::domain::gateway::GatewayStatus;
    use crate::domain::payment::{PaymentMethod, PaymentStatus, StatePatch, TransactionIdSource};
    use crate::infrastructure::sandbox::{SandboxBackend, SandboxGateway};

    async fn monitored(gateway: SandboxGateway) -> (ReconciliationMonitor, Arc<UnifiedPaymentService>, Arc<SandboxGateway>) {
        let gateway = Arc::new(gateway);
        let service = Arc::new(UnifiedPaymentService::new(
            Arc::new(PaymentStateStore::default()),
            gateway.clone(),
            Arc::new(SandboxBackend::new()),
        ));
        let store = service.store();
        store.create_state("order-1", PaymentMethod::Nequi).await.unwrap();
        store
            .update_state(
                "order-1",
                StatePatch::default().with_transaction_id(TransactionIdSource::GatewayResponse, "tx-1"),
            )
            .await
            .unwrap();
        let monitor = ReconciliationMonitor::new(Arc::clone(&service), MonitorConfig::default());
        (monitor, service, gateway)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_confirmed() {
        let (monitor, service, gateway) = monitored(SandboxGateway::new().with_status_script([
            GatewayStatus::Pending,
            GatewayStatus::Pending,
            GatewayStatus::Approved,
        ]))
        .await;

        let handle = monitor.watch("order-1");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(handle.is_stopped());
        assert_eq!(gateway.status_calls(), 3);
        assert_eq!(
            service.get_state("order-1").await.unwrap().status,
            PaymentStatus::Confirmed
        );
        assert!(!monitor.is_watching("order-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_watch_shares_task() {
        let (monitor, _, gateway) = monitored(SandboxGateway::new()).await;

        let first = monitor.watch("order-1");
        let second = monitor.watch("order-1");
        assert_eq!(monitor.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(gateway.status_calls(), 1);

        second.stop();
        assert!(first.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let (monitor, _, gateway) = monitored(SandboxGateway::new()).await;
        let handle = monitor.watch("order-1");

        monitor.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(handle.is_stopped());
        assert_eq!(gateway.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_transaction_id() {
        let gateway = Arc::new(SandboxGateway::new());
        let service = Arc::new(UnifiedPaymentService::new(
            Arc::new(PaymentStateStore::default()),
            gateway.clone(),
            Arc::new(SandboxBackend::new()),
        ));
        service
            .store()
            .create_state("order-1", PaymentMethod::Widget)
            .await
            .unwrap();
        let monitor = ReconciliationMonitor::new(Arc::clone(&service), MonitorConfig::default());

        let handle = monitor.watch("order-1");
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!handle.is_stopped());
        assert_eq!(gateway.status_calls(), 0);
        handle.stop();
    }
}
