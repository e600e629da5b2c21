//! In-process stand-ins for the gateway and the order backend.
//!
//! Outcomes are scripted up front and every remote call is counted, which
//! makes the sandbox useful both for local demos and for asserting how often
//! the reconciliation loop reaches out.

use crate::domain::gateway::{
    AcceptanceTokens, CardDetails, CheckoutRequest, GatewayStatus, GatewayTransaction, RailPayload,
    TransactionRequest,
};
use crate::domain::ports::{OrderConfirmer, PaymentGateway, PricingQuoter};
use crate::domain::pricing::{PricingBreakdown, PricingConfig};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Sandbox card that is always approved.
pub const APPROVED_CARD: &str = "4242424242424242";
/// Sandbox card that is always declined.
pub const DECLINED_CARD: &str = "4111111111111111";

#[derive(Debug)]
struct SandboxState {
    creation_status: GatewayStatus,
    status_script: VecDeque<(GatewayStatus, Option<String>)>,
    transient_failures: usize,
    fail_creation: bool,
    references: HashMap<String, String>,
}

/// Scripted payment gateway.
///
/// `create_transaction` answers with the configured creation status (cards
/// follow the sandbox card numbers instead). `transaction_status` walks the
/// status script and keeps repeating its last entry.
#[derive(Debug)]
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
    tokenize_calls: AtomicUsize,
    create_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SandboxState {
                creation_status: GatewayStatus::Pending,
                status_script: VecDeque::new(),
                transient_failures: 0,
                fail_creation: false,
                references: HashMap::new(),
            }),
            tokenize_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_creation_status(self, status: GatewayStatus) -> Self {
        self.lock().creation_status = status;
        self
    }

    /// Statuses returned by successive status queries.
    pub fn with_status_script(self, script: impl IntoIterator<Item = GatewayStatus>) -> Self {
        self.lock().status_script = script.into_iter().map(|s| (s, None)).collect();
        self
    }

    /// Appends a status with a human-readable message.
    pub fn then_status(self, status: GatewayStatus, message: impl Into<String>) -> Self {
        self.lock()
            .status_script
            .push_back((status, Some(message.into())));
        self
    }

    /// The next `count` status queries fail as if the network were down.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.lock().transient_failures = count;
        self
    }

    pub fn failing_creation(self) -> Self {
        self.lock().fail_creation = true;
        self
    }

    pub fn tokenize_calls(&self) -> usize {
        self.tokenize_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_card(card: &CardDetails) -> Result<()> {
    let digits_only = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    if !digits_only(&card.number) || !(13..=19).contains(&card.number.len()) || !luhn(&card.number)
    {
        return Err(PaymentError::Validation("Invalid card number".to_string()));
    }
    let month: u32 = card.exp_month.parse().unwrap_or(0);
    if !(1..=12).contains(&month) || !digits_only(&card.exp_year) {
        return Err(PaymentError::Validation("Invalid expiry date".to_string()));
    }
    if !digits_only(&card.cvc) || !(3..=4).contains(&card.cvc.len()) {
        return Err(PaymentError::Validation("Invalid CVC".to_string()));
    }
    Ok(())
}

fn luhn(number: &str) -> bool {
    let sum: u32 = number
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn tokenize_card(&self, card: &CardDetails) -> Result<String> {
        self.tokenize_calls.fetch_add(1, Ordering::SeqCst);
        validate_card(card)?;
        let last4 = &card.number[card.number.len() - 4..];
        let nonce = Uuid::new_v4().simple().to_string();
        Ok(format!("tok_sandbox_{}_{}", last4, &nonce[..12]))
    }

    async fn acceptance_tokens(&self) -> Result<AcceptanceTokens> {
        Ok(AcceptanceTokens {
            acceptance_token: "sandbox-acceptance".to_string(),
            accept_personal_auth: "sandbox-personal-data".to_string(),
        })
    }

    async fn create_transaction(&self, request: &TransactionRequest) -> Result<GatewayTransaction> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.fail_creation {
            return Err(PaymentError::Transient(
                "Sandbox gateway unreachable".to_string(),
            ));
        }

        let (status, status_message, redirect_url) = match &request.payment_method {
            RailPayload::Card { token, .. } if token.contains("_1111_") => (
                GatewayStatus::Declined,
                Some("Insufficient funds".to_string()),
                None,
            ),
            RailPayload::Card { token, .. } if token.contains("_4242_") => {
                (GatewayStatus::Approved, None, None)
            }
            RailPayload::BancolombiaTransfer { .. } | RailPayload::Pse { .. } => (
                state.creation_status,
                None,
                Some(format!(
                    "https://sandbox.gateway.test/redirect/{}",
                    request.reference
                )),
            ),
            _ => (state.creation_status, None, None),
        };

        let id = format!("sbx-{}", Uuid::new_v4().simple());
        state
            .references
            .insert(id.clone(), request.reference.clone());

        Ok(GatewayTransaction {
            id,
            status,
            status_message,
            reference: Some(request.reference.clone()),
            redirect_url,
        })
    }

    async fn transaction_status(&self, transaction_id: &str) -> Result<GatewayTransaction> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(PaymentError::Transient("Sandbox status timeout".to_string()));
        }

        let (status, status_message) = if state.status_script.len() > 1 {
            state.status_script.pop_front()
        } else {
            state.status_script.front().cloned()
        }
        .unwrap_or((GatewayStatus::Pending, None));

        Ok(GatewayTransaction {
            id: transaction_id.to_string(),
            status,
            status_message,
            reference: state.references.get(transaction_id).cloned(),
            redirect_url: None,
        })
    }

    fn checkout_url(&self, request: &CheckoutRequest) -> Result<String> {
        Ok(format!(
            "https://sandbox.gateway.test/checkout/{}?amount-in-cents={}&currency={}",
            request.reference, request.amount_in_cents, request.currency
        ))
    }
}

/// Scripted order backend: confirms orders and serves pricing quotes.
#[derive(Debug, Default)]
pub struct SandboxBackend {
    pricing: PricingConfig,
    confirm_calls: AtomicUsize,
    confirm_failures: AtomicUsize,
}

impl SandboxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = pricing;
        self
    }

    /// The next `count` confirmations fail transiently.
    pub fn with_confirm_failures(self, count: usize) -> Self {
        self.confirm_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn confirm_calls(&self) -> usize {
        self.confirm_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderConfirmer for SandboxBackend {
    async fn confirm_order(&self, order_id: &str, _transaction_id: &str) -> Result<()> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.confirm_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.confirm_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PaymentError::Transient(format!(
                "Order backend unavailable while confirming {}",
                order_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PricingQuoter for SandboxBackend {
    async fn quote(
        &self,
        service_price: Decimal,
        margin_percent: Decimal,
    ) -> Result<PricingBreakdown> {
        self.pricing.compute(service_price, margin_percent)
    }
}
