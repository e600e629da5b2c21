use super::gateway::CardDetails;
use super::payment::{PaymentMethod, PaymentState};
use crate::error::{PaymentError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// PSE payer details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankDetails {
    pub financial_institution_code: String,
    /// 0 for natural persons, 1 for companies.
    pub user_type: u8,
    pub legal_id_type: String,
    pub legal_id: String,
}

/// A request to pay for an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: String,
    pub method: PaymentMethod,
    /// Amount in major currency units.
    pub amount: Decimal,
    pub currency: String,
    pub customer_email: String,
    #[serde(default)]
    pub card: Option<CardDetails>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub bank: Option<BankDetails>,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

impl PaymentRequest {
    pub fn new(
        order_id: impl Into<String>,
        method: PaymentMethod,
        amount: Decimal,
        customer_email: impl Into<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            method,
            amount,
            currency: "COP".to_string(),
            customer_email: customer_email.into(),
            card: None,
            phone_number: None,
            bank: None,
            redirect_url: None,
        }
    }

    /// Checks the fields every rail needs plus the rail-specific ones.
    pub fn validate(&self) -> Result<()> {
        if self.order_id.trim().is_empty() {
            return Err(PaymentError::Validation("Order id is required".to_string()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(
                "Amount must be positive".to_string(),
            ));
        }
        self.amount_in_cents()?;
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PaymentError::Validation(format!(
                "Invalid currency code: {}",
                self.currency
            )));
        }
        let email = self.customer_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(PaymentError::Validation(
                "A valid customer email is required".to_string(),
            ));
        }

        match self.method {
            PaymentMethod::Card if self.card.is_none() => Err(PaymentError::Validation(
                "Card details are required for card payments".to_string(),
            )),
            PaymentMethod::Nequi if !has_text(&self.phone_number) => Err(
                PaymentError::Validation("Phone number is required for Nequi".to_string()),
            ),
            PaymentMethod::Pse => match &self.bank {
                Some(bank)
                    if !bank.financial_institution_code.trim().is_empty()
                        && !bank.legal_id.trim().is_empty() =>
                {
                    Ok(())
                }
                _ => Err(PaymentError::Validation(
                    "Bank code and legal id are required for PSE".to_string(),
                )),
            },
            _ => Ok(()),
        }
    }

    /// The amount in minor units (cents), rounded half away from zero.
    pub fn amount_in_cents(&self) -> Result<i64> {
        self.amount
            .checked_mul(dec!(100))
            .and_then(|cents| {
                cents
                    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                    .to_i64()
            })
            .ok_or_else(|| PaymentError::Validation(format!("Amount out of range: {}", self.amount)))
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Outcome of a payment initiation handed back to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResult {
    pub success: bool,
    pub error: Option<String>,
    pub requires_redirect: bool,
    pub redirect_url: Option<String>,
    /// `None` when the request failed validation before any state existed.
    pub state: Option<PaymentState>,
}

impl PaymentResult {
    pub fn succeeded(state: PaymentState) -> Self {
        Self {
            success: true,
            error: None,
            requires_redirect: false,
            redirect_url: None,
            state: Some(state),
        }
    }

    pub fn redirect(state: PaymentState, url: Option<String>) -> Self {
        Self {
            requires_redirect: true,
            redirect_url: url,
            ..Self::succeeded(state)
        }
    }

    pub fn failed(error: &PaymentError, state: Option<PaymentState>) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            requires_redirect: false,
            redirect_url: None,
            state,
        }
    }
}
