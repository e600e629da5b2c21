use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Percentage fee the gateway charges on the gross transaction amount.
pub const GATEWAY_RATE: Decimal = dec!(0.0265);
/// Fixed fee per transaction, in currency units.
pub const GATEWAY_FIXED: Decimal = dec!(700);
/// Tax applied to the gateway fee subtotal (not to the principal).
pub const GATEWAY_TAX: Decimal = dec!(0.19);
/// Floor for the platform margin.
pub const MIN_PLATFORM_MARGIN: Decimal = dec!(2000);
pub const DEFAULT_MARGIN_PERCENT: Decimal = dec!(5);

/// Constants driving the price split.
///
/// The defaults match the gateway's published fee schedule; the remote pricing
/// endpoint uses the same values, so local previews and authoritative quotes
/// agree field by field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub gateway_rate: Decimal,
    pub gateway_fixed: Decimal,
    pub gateway_tax: Decimal,
    pub min_platform_margin: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            gateway_rate: GATEWAY_RATE,
            gateway_fixed: GATEWAY_FIXED,
            gateway_tax: GATEWAY_TAX,
            min_platform_margin: MIN_PLATFORM_MARGIN,
        }
    }
}

/// Three-way split of a service price between client, provider and platform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    pub service_price: Decimal,
    pub margin_percent: Decimal,
    pub platform_margin: Decimal,
    /// Gross amount the gateway fee is computed on (price + margin).
    pub base_amount: Decimal,
    pub fee_percent_part: Decimal,
    pub fee_fixed: Decimal,
    pub fee_subtotal: Decimal,
    pub fee_tax: Decimal,
    pub total_gateway_cost: Decimal,
    pub gateway_cost_client: Decimal,
    pub gateway_cost_provider: Decimal,
    /// What the payer is charged.
    pub total_price: Decimal,
    /// What the provider nets after absorbing half the gateway fee.
    pub provider_earnings: Decimal,
    pub platform_earnings: Decimal,
}

impl PricingConfig {
    /// Computes the breakdown for `service_price` with `margin_percent` in `[0, 100]`.
    ///
    /// Out-of-range margins are rejected rather than clamped.
    pub fn compute(&self, service_price: Decimal, margin_percent: Decimal) -> Result<PricingBreakdown> {
        if service_price <= Decimal::ZERO {
            return Err(PaymentError::Validation(
                "Service price must be positive".to_string(),
            ));
        }
        if margin_percent < Decimal::ZERO || margin_percent > dec!(100) {
            return Err(PaymentError::Validation(format!(
                "Margin percent must be within [0, 100], got {}",
                margin_percent
            )));
        }

        let platform_margin = in_range(
            service_price
                .checked_mul(margin_percent)
                .and_then(|v| v.checked_div(dec!(100))),
        )?
        .max(self.min_platform_margin);
        let base_amount = in_range(service_price.checked_add(platform_margin))?;

        let fee_percent_part = in_range(base_amount.checked_mul(self.gateway_rate))?;
        let fee_subtotal = in_range(fee_percent_part.checked_add(self.gateway_fixed))?;
        let fee_tax = in_range(fee_subtotal.checked_mul(self.gateway_tax))?;
        let total_gateway_cost = in_range(fee_subtotal.checked_add(fee_tax))?;

        // Mixed strategy: client and provider each absorb half.
        let gateway_cost_client = in_range(total_gateway_cost.checked_div(dec!(2)))?;
        let gateway_cost_provider = gateway_cost_client;

        Ok(PricingBreakdown {
            service_price,
            margin_percent,
            platform_margin,
            base_amount,
            fee_percent_part,
            fee_fixed: self.gateway_fixed,
            fee_subtotal,
            fee_tax,
            total_gateway_cost,
            gateway_cost_client,
            gateway_cost_provider,
            total_price: in_range(base_amount.checked_add(gateway_cost_client))?,
            provider_earnings: in_range(service_price.checked_sub(gateway_cost_provider))?,
            platform_earnings: platform_margin,
        })
    }
}

fn in_range(value: Option<Decimal>) -> Result<Decimal> {
    value.ok_or_else(|| PaymentError::Validation("Amount out of range".to_string()))
}

/// Computes a breakdown with the default fee schedule.
pub fn compute_breakdown(service_price: Decimal, margin_percent: Decimal) -> Result<PricingBreakdown> {
    PricingConfig::default().compute(service_price, margin_percent)
}

impl PricingBreakdown {
    /// Returns the name of the first field that differs from `other`.
    pub fn first_mismatch(&self, other: &PricingBreakdown) -> Option<&'static str> {
        let fields: [(&'static str, Decimal, Decimal); 14] = [
            ("service_price", self.service_price, other.service_price),
            ("margin_percent", self.margin_percent, other.margin_percent),
            ("platform_margin", self.platform_margin, other.platform_margin),
            ("base_amount", self.base_amount, other.base_amount),
            ("fee_percent_part", self.fee_percent_part, other.fee_percent_part),
            ("fee_fixed", self.fee_fixed, other.fee_fixed),
            ("fee_subtotal", self.fee_subtotal, other.fee_subtotal),
            ("fee_tax", self.fee_tax, other.fee_tax),
            ("total_gateway_cost", self.total_gateway_cost, other.total_gateway_cost),
            ("gateway_cost_client", self.gateway_cost_client, other.gateway_cost_client),
            ("gateway_cost_provider", self.gateway_cost_provider, other.gateway_cost_provider),
            ("total_price", self.total_price, other.total_price),
            ("provider_earnings", self.provider_earnings, other.provider_earnings),
            ("platform_earnings", self.platform_earnings, other.platform_earnings),
        ];
        fields
            .into_iter()
            .find(|(_, local, remote)| local != remote)
            .map(|(name, _, _)| name)
    }
}
