use super::gateway::{
    AcceptanceTokens, CardDetails, CheckoutRequest, GatewayTransaction, TransactionRequest,
};
use super::payment::PaymentState;
use super::pricing::PricingBreakdown;
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Persistence for payment states, keyed by order id.
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn store(&self, state: PaymentState) -> Result<()>;
    async fn get(&self, order_id: &str) -> Result<Option<PaymentState>>;
    async fn get_all(&self) -> Result<Vec<PaymentState>>;
}

pub type StateRepositoryBox = Box<dyn StateRepository>;

/// The payment gateway's REST surface.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Exchanges raw card fields for an opaque token.
    async fn tokenize_card(&self, card: &CardDetails) -> Result<String>;
    async fn acceptance_tokens(&self) -> Result<AcceptanceTokens>;
    async fn create_transaction(&self, request: &TransactionRequest) -> Result<GatewayTransaction>;
    async fn transaction_status(&self, transaction_id: &str) -> Result<GatewayTransaction>;
    /// URL of the hosted checkout page for `request`.
    fn checkout_url(&self, request: &CheckoutRequest) -> Result<String>;
}

/// Order backend step that promotes an approved payment to a confirmed booking.
#[async_trait]
pub trait OrderConfirmer: Send + Sync {
    async fn confirm_order(&self, order_id: &str, transaction_id: &str) -> Result<()>;
}

/// Server-side authoritative pricing.
#[async_trait]
pub trait PricingQuoter: Send + Sync {
    async fn quote(&self, service_price: Decimal, margin_percent: Decimal)
    -> Result<PricingBreakdown>;
}

pub type GatewayRef = Arc<dyn PaymentGateway>;
pub type ConfirmerRef = Arc<dyn OrderConfirmer>;
pub type QuoterRef = Arc<dyn PricingQuoter>;
