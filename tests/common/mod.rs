#![allow(dead_code)]

use paysync::application::service::UnifiedPaymentService;
use paysync::application::store::PaymentStateStore;
use paysync::domain::gateway::{
    CardDetails, GatewayStatus, GatewayTransaction, WebhookData, WebhookEvent,
};
use paysync::domain::payment::PaymentMethod;
use paysync::domain::request::PaymentRequest;
use paysync::infrastructure::sandbox::{SandboxBackend, SandboxGateway};
use rust_decimal_macros::dec;
use std::sync::Arc;

pub struct Harness {
    pub service: Arc<UnifiedPaymentService>,
    pub gateway: Arc<SandboxGateway>,
    pub backend: Arc<SandboxBackend>,
}

pub fn harness(gateway: SandboxGateway) -> Harness {
    harness_with_backend(gateway, SandboxBackend::new())
}

pub fn harness_with_backend(gateway: SandboxGateway, backend: SandboxBackend) -> Harness {
    let gateway = Arc::new(gateway);
    let backend = Arc::new(backend);
    let service = Arc::new(UnifiedPaymentService::new(
        Arc::new(PaymentStateStore::default()),
        gateway.clone(),
        backend.clone(),
    ));
    Harness {
        service,
        gateway,
        backend,
    }
}

pub fn request(order_id: &str, method: PaymentMethod) -> PaymentRequest {
    PaymentRequest::new(order_id, method, dec!(107072.09), "cliente@example.com")
}

pub fn nequi_request(order_id: &str) -> PaymentRequest {
    let mut request = request(order_id, PaymentMethod::Nequi);
    request.phone_number = Some("3991111111".to_string());
    request
}

pub fn card_request(order_id: &str, number: &str) -> PaymentRequest {
    let mut request = request(order_id, PaymentMethod::Card);
    request.card = Some(CardDetails {
        number: number.to_string(),
        cvc: "123".to_string(),
        exp_month: "08".to_string(),
        exp_year: "30".to_string(),
        card_holder: "Cliente Prueba".to_string(),
        installments: 1,
    });
    request
}

pub fn webhook(order_id: &str, transaction_id: &str, status: GatewayStatus) -> WebhookEvent {
    WebhookEvent {
        event: "transaction.updated".to_string(),
        data: WebhookData {
            transaction: GatewayTransaction {
                id: transaction_id.to_string(),
                status,
                status_message: None,
                reference: Some(order_id.to_string()),
                redirect_url: None,
            },
        },
    }
}
