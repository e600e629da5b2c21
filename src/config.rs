//! Runtime configuration

use crate::application::monitor::DEFAULT_POLL_INTERVAL;
use crate::domain::pricing::{MIN_PLATFORM_MARGIN, PricingConfig};
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CHECKOUT_URL: &str = "https://checkout.wompi.co/p/";
const DEFAULT_PUBLIC_KEY: &str = "pub_test_sandbox";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Gateway REST base URL (env: PAYSYNC_GATEWAY_URL). Unset means the
    /// in-process sandbox gateway is used.
    pub gateway_url: Option<String>,
    pub public_key: String,
    /// Marketplace backend base URL (env: PAYSYNC_BACKEND_URL)
    pub backend_url: Option<String>,
    /// Hosted checkout page (env: PAYSYNC_CHECKOUT_URL)
    pub checkout_url: String,
    pub poll_interval: Duration,
    pub currency: String,
    /// Platform margin floor in major units (env: PAYSYNC_MIN_MARGIN)
    pub min_margin: Decimal,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_url: None,
            public_key: DEFAULT_PUBLIC_KEY.to_string(),
            backend_url: None,
            checkout_url: DEFAULT_CHECKOUT_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            currency: "COP".to_string(),
            min_margin: MIN_PLATFORM_MARGIN,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source; empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let poll_interval = match var("PAYSYNC_POLL_INTERVAL_SECS") {
            Some(raw) => match parse::<u64>("PAYSYNC_POLL_INTERVAL_SECS", &raw)? {
                0 => {
                    return Err(PaymentError::Validation(
                        "PAYSYNC_POLL_INTERVAL_SECS must be at least 1".to_string(),
                    ));
                }
                secs => Duration::from_secs(secs),
            },
            None => defaults.poll_interval,
        };

        Ok(Self {
            gateway_url: var("PAYSYNC_GATEWAY_URL"),
            public_key: var("PAYSYNC_PUBLIC_KEY").unwrap_or(defaults.public_key),
            backend_url: var("PAYSYNC_BACKEND_URL"),
            checkout_url: var("PAYSYNC_CHECKOUT_URL").unwrap_or(defaults.checkout_url),
            poll_interval,
            currency: var("PAYSYNC_CURRENCY")
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or(defaults.currency),
            min_margin: var("PAYSYNC_MIN_MARGIN")
                .map(|raw| parse::<Decimal>("PAYSYNC_MIN_MARGIN", &raw))
                .transpose()?
                .unwrap_or(defaults.min_margin),
        })
    }

    pub fn pricing(&self) -> PricingConfig {
        PricingConfig {
            min_platform_margin: self.min_margin,
            ..PricingConfig::default()
        }
    }
}

fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| PaymentError::Validation(format!("{name} has an invalid value: {raw}")))
}
