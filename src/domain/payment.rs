use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Payment rail chosen for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    Card,
    Widget,
    CheckoutWeb,
    Nequi,
    Bancolombia,
    Pse,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Widget => "widget",
            PaymentMethod::CheckoutWeb => "checkout-web",
            PaymentMethod::Nequi => "nequi",
            PaymentMethod::Bancolombia => "bancolombia",
            PaymentMethod::Pse => "pse",
            PaymentMethod::Cash => "cash",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "card" => Ok(PaymentMethod::Card),
            "widget" => Ok(PaymentMethod::Widget),
            "checkout-web" | "checkout_web" => Ok(PaymentMethod::CheckoutWeb),
            "nequi" => Ok(PaymentMethod::Nequi),
            "bancolombia" => Ok(PaymentMethod::Bancolombia),
            "pse" => Ok(PaymentMethod::Pse),
            "cash" => Ok(PaymentMethod::Cash),
            other => Err(PaymentError::Validation(format!(
                "Unknown payment method: {}",
                other
            ))),
        }
    }
}

/// Status of an order's payment.
///
/// Ordered `Pending < Approved < Confirmed`; `Error` sits outside that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Confirmed,
    Error,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Confirmed | PaymentStatus::Error)
    }

    fn rank(&self) -> Option<u8> {
        match self {
            PaymentStatus::Pending => Some(0),
            PaymentStatus::Approved => Some(1),
            PaymentStatus::Confirmed => Some(2),
            PaymentStatus::Error => None,
        }
    }

    /// Whether a patch may move a state from `self` to `next`.
    ///
    /// Re-applying the current status is a pass-through. Nothing leaves
    /// `Confirmed`, and `Error` is only left through a retry.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        if *self == next {
            return true;
        }
        match (self.rank(), next.rank()) {
            (_, _) if self.is_terminal() => false,
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Approved => "APPROVED",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Where a transaction id was learned from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionIdSource {
    GatewayResponse,
    RedirectQuery,
    Webhook,
    /// Locally synthesized id for cash payments.
    Local,
}

/// Picks the first non-empty candidate in source priority order.
pub fn resolve_transaction_id(
    candidates: &[(TransactionIdSource, Option<&str>)],
) -> Option<(TransactionIdSource, String)> {
    let mut ordered: Vec<_> = candidates.to_vec();
    ordered.sort_by_key(|(source, _)| *source);
    ordered.into_iter().find_map(|(source, id)| {
        id.map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| (source, id.to_string()))
    })
}

/// Builds the stand-in transaction id for cash payments.
pub fn cash_transaction_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("CASH-{}-{}", now.timestamp_millis(), &suffix[..8])
}

/// The authoritative payment state of one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentState {
    pub order_id: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub transaction_id_source: Option<TransactionIdSource>,
    /// Present only while `status` is `Error`.
    pub error: Option<String>,
    /// Starts at 1 and grows with each retry after an error.
    pub attempt: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Transaction ids of earlier attempts. Late notifications about them
    /// must not touch the current attempt.
    #[serde(default)]
    pub superseded_transaction_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentState {
    pub fn new(order_id: impl Into<String>, method: PaymentMethod, now: DateTime<Utc>) -> Self {
        Self {
            order_id: order_id.into(),
            method,
            status: PaymentStatus::Pending,
            transaction_id: None,
            transaction_id_source: None,
            error: None,
            attempt: 1,
            last_checked_at: None,
            superseded_transaction_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh attempt replacing this errored one.
    pub fn restarted(&self, method: PaymentMethod, now: DateTime<Utc>) -> Self {
        let mut superseded = self.superseded_transaction_ids.clone();
        superseded.extend(self.transaction_id.iter().cloned());
        Self {
            attempt: self.attempt + 1,
            superseded_transaction_ids: superseded,
            created_at: self.created_at,
            ..Self::new(self.order_id.clone(), method, now)
        }
    }

    /// Whether `transaction_id` belongs to an earlier attempt of this order.
    pub fn is_superseded(&self, transaction_id: &str) -> bool {
        self.superseded_transaction_ids
            .iter()
            .any(|id| id == transaction_id.trim())
    }

    /// Whether the reconciliation monitor should keep polling this state.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self.status, PaymentStatus::Pending | PaymentStatus::Approved)
            && self.transaction_id.is_some()
    }

    /// Merges `patch` into the state.
    ///
    /// Validation happens before any field is touched, so a rejected patch
    /// leaves the state as it was. A transaction id is only written if none
    /// is set yet.
    pub fn apply(&mut self, patch: StatePatch, now: DateTime<Utc>) -> Result<()> {
        let incoming_id = patch
            .transaction_id
            .filter(|(_, id)| !id.trim().is_empty());
        if let Some((_, id)) = &incoming_id
            && self.is_superseded(id)
        {
            return Err(PaymentError::Validation(format!(
                "Transaction {} belongs to an earlier attempt",
                id
            )));
        }

        if let Some(next) = patch.status {
            if !self.status.can_transition_to(next) {
                return Err(PaymentError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            if next == PaymentStatus::Confirmed
                && self.transaction_id.is_none()
                && incoming_id.is_none()
            {
                return Err(PaymentError::Validation(
                    "A transaction id is required before confirming".to_string(),
                ));
            }
        }

        if let Some((source, id)) = incoming_id {
            match &self.transaction_id {
                None => {
                    self.transaction_id = Some(id);
                    self.transaction_id_source = Some(source);
                }
                Some(existing) if *existing != id => {
                    tracing::warn!(
                        order_id = %self.order_id,
                        existing = %existing,
                        ignored = %id,
                        ?source,
                        "Ignoring transaction id, one is already recorded"
                    );
                }
                Some(_) => {}
            }
        }

        if let Some(next) = patch.status {
            self.status = next;
        }
        if self.status == PaymentStatus::Error {
            if let Some(message) = patch.error {
                self.error = Some(message);
            } else if self.error.is_none() {
                self.error = Some("Payment failed".to_string());
            }
        } else {
            self.error = None;
        }
        if let Some(checked_at) = patch.last_checked_at {
            self.last_checked_at = Some(checked_at);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial update for a [`PaymentState`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub status: Option<PaymentStatus>,
    pub transaction_id: Option<(TransactionIdSource, String)>,
    pub error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl StatePatch {
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(PaymentStatus::Error),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_transaction_id(mut self, source: TransactionIdSource, id: impl Into<String>) -> Self {
        self.transaction_id = Some((source, id.into()));
        self
    }

    pub fn checked_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_checked_at = Some(at);
        self
    }
}

/// Notification published by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    StateChanged { state: PaymentState },
    AttemptRestarted { state: PaymentState },
}

impl PaymentEvent {
    pub fn state(&self) -> &PaymentState {
        match self {
            PaymentEvent::StateChanged { state } | PaymentEvent::AttemptRestarted { state } => {
                state
            }
        }
    }
}
