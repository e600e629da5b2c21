use crate::domain::ports::QuoterRef;
use crate::domain::pricing::{DEFAULT_MARGIN_PERCENT, PricingBreakdown, PricingConfig};
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;

/// Price previews for checkout screens.
///
/// The backend quote is authoritative when a quoter is configured; the local
/// computation mirrors it so a preview can be shown offline and compared.
pub struct PricingPreview {
    config: PricingConfig,
    quoter: Option<QuoterRef>,
}

impl PricingPreview {
    pub fn new(config: PricingConfig, quoter: Option<QuoterRef>) -> Self {
        Self { config, quoter }
    }

    pub fn local(config: PricingConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    pub fn compute_local(
        &self,
        service_price: Decimal,
        margin_percent: Option<Decimal>,
    ) -> Result<PricingBreakdown> {
        self.config
            .compute(service_price, margin_percent.unwrap_or(DEFAULT_MARGIN_PERCENT))
    }

    pub async fn quote(
        &self,
        service_price: Decimal,
        margin_percent: Option<Decimal>,
    ) -> Result<PricingBreakdown> {
        let margin = margin_percent.unwrap_or(DEFAULT_MARGIN_PERCENT);
        match &self.quoter {
            Some(quoter) => quoter.quote(service_price, margin).await,
            None => self.config.compute(service_price, margin),
        }
    }

    /// Fetches the remote quote and checks that the local computation agrees
    /// with it field for field.
    pub async fn verify_parity(
        &self,
        service_price: Decimal,
        margin_percent: Option<Decimal>,
    ) -> Result<PricingBreakdown> {
        let local = self.compute_local(service_price, margin_percent)?;
        let remote = self.quote(service_price, margin_percent).await?;
        if let Some(field) = local.first_mismatch(&remote) {
            tracing::warn!(
                field,
                %service_price,
                "Local pricing disagrees with the backend quote"
            );
            return Err(PaymentError::PricingMismatch(field));
        }
        Ok(remote)
    }
}
