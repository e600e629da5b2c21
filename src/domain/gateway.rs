//! Wire-level types exchanged with the payment gateway.

use serde::{Deserialize, Serialize};

/// Status reported by the gateway for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayStatus {
    Approved,
    Declined,
    Error,
    Pending,
    Voided,
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatewayStatus::Approved => "APPROVED",
            GatewayStatus::Declined => "DECLINED",
            GatewayStatus::Error => "ERROR",
            GatewayStatus::Pending => "PENDING",
            GatewayStatus::Voided => "VOIDED",
        };
        f.write_str(s)
    }
}

impl GatewayStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            GatewayStatus::Declined | GatewayStatus::Error | GatewayStatus::Voided
        )
    }
}

/// Raw card fields, sent only to the tokenization endpoint.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDetails {
    pub number: String,
    pub cvc: String,
    pub exp_month: String,
    pub exp_year: String,
    pub card_holder: String,
    #[serde(default = "default_installments")]
    pub installments: u32,
}

fn default_installments() -> u32 {
    1
}

// Card numbers never end up in logs.
impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last4 = self
            .number
            .len()
            .checked_sub(4)
            .and_then(|start| self.number.get(start..))
            .unwrap_or("");
        f.debug_struct("CardDetails")
            .field("number", &format_args!("****{}", last4))
            .field("card_holder", &self.card_holder)
            .field("installments", &self.installments)
            .finish_non_exhaustive()
    }
}

/// Legal acceptance tokens the gateway requires before charging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceTokens {
    pub acceptance_token: String,
    pub accept_personal_auth: String,
}

/// Method-specific payload of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RailPayload {
    Card {
        token: String,
        installments: u32,
    },
    Nequi {
        phone_number: String,
    },
    BancolombiaTransfer {
        user_type: String,
        payment_description: String,
    },
    Pse {
        user_type: u8,
        user_legal_id_type: String,
        user_legal_id: String,
        financial_institution_code: String,
        payment_description: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Our order id; the gateway echoes it back in webhooks.
    pub reference: String,
    pub amount_in_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub acceptance_token: String,
    pub accept_personal_auth: String,
    pub payment_method: RailPayload,
    pub redirect_url: Option<String>,
}

/// A transaction as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub id: String,
    pub status: GatewayStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    /// Where the payer must go to approve (bank redirect flows).
    #[serde(default)]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub reference: String,
    pub amount_in_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub redirect_url: Option<String>,
}

/// Gateway webhook notification (`transaction.updated`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookData {
    pub transaction: GatewayTransaction,
}
