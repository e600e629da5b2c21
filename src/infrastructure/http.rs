//! REST clients for the payment gateway and the marketplace backend.

use crate::domain::gateway::{
    AcceptanceTokens, CardDetails, CheckoutRequest, GatewayStatus, GatewayTransaction,
    TransactionRequest,
};
use crate::domain::ports::{OrderConfirmer, PaymentGateway, PricingQuoter};
use crate::domain::pricing::PricingBreakdown;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PresignedToken {
    acceptance_token: String,
}

#[derive(Debug, Deserialize)]
struct MerchantData {
    presigned_acceptance: PresignedToken,
    presigned_personal_data_auth: PresignedToken,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    id: String,
    status: GatewayStatus,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    payment_method: Option<serde_json::Value>,
}

impl From<TransactionData> for GatewayTransaction {
    fn from(data: TransactionData) -> Self {
        let redirect_url = data
            .payment_method
            .as_ref()
            .and_then(|pm| pm.pointer("/extra/async_payment_url"))
            .and_then(|url| url.as_str())
            .map(String::from);
        Self {
            id: data.id,
            status: data.status,
            status_message: data.status_message,
            reference: data.reference,
            redirect_url,
        }
    }
}

fn build_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| PaymentError::Internal(Box::new(e)))
}

fn parse_base(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| PaymentError::Validation(format!("Invalid URL {}: {}", url, e)))
}

/// Maps a non-success response to the error taxonomy.
///
/// Client errors carry the gateway's explanation and are not retried; server
/// errors and rate limiting are transient.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(PaymentError::Transient(format!("{}: {}", status, body)))
    } else {
        Err(PaymentError::Validation(error_reason(&body).unwrap_or(body)))
    }
}

fn error_reason(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    if let Some(messages) = error.get("messages") {
        return Some(messages.to_string());
    }
    error
        .get("reason")
        .and_then(|r| r.as_str())
        .map(String::from)
}

/// Gateway client speaking the public REST API with the merchant's public key.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    checkout_url: Url,
    public_key: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, checkout_url: &str, public_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: parse_base(base_url)?,
            checkout_url: parse_base(checkout_url)?,
            public_key: public_key.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        parse_base(&format!("{}/{}", base, path.trim_start_matches('/')))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn tokenize_card(&self, card: &CardDetails) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint("tokens/cards")?)
            .bearer_auth(&self.public_key)
            .json(&json!({
                "number": card.number,
                "cvc": card.cvc,
                "exp_month": card.exp_month,
                "exp_year": card.exp_year,
                "card_holder": card.card_holder,
            }))
            .send()
            .await?;
        let token: Envelope<TokenData> = read_json(response).await?;
        Ok(token.data.id)
    }

    async fn acceptance_tokens(&self) -> Result<AcceptanceTokens> {
        let response = self
            .client
            .get(self.endpoint(&format!("merchants/{}", self.public_key))?)
            .send()
            .await?;
        let merchant: Envelope<MerchantData> = read_json(response).await?;
        Ok(AcceptanceTokens {
            acceptance_token: merchant.data.presigned_acceptance.acceptance_token,
            accept_personal_auth: merchant.data.presigned_personal_data_auth.acceptance_token,
        })
    }

    async fn create_transaction(&self, request: &TransactionRequest) -> Result<GatewayTransaction> {
        let response = self
            .client
            .post(self.endpoint("transactions")?)
            .bearer_auth(&self.public_key)
            .json(request)
            .send()
            .await?;
        let tx: Envelope<TransactionData> = read_json(response).await?;
        Ok(tx.data.into())
    }

    async fn transaction_status(&self, transaction_id: &str) -> Result<GatewayTransaction> {
        let response = self
            .client
            .get(self.endpoint(&format!("transactions/{}", transaction_id))?)
            .send()
            .await?;
        let tx: Envelope<TransactionData> = read_json(response).await?;
        Ok(tx.data.into())
    }

    fn checkout_url(&self, request: &CheckoutRequest) -> Result<String> {
        let amount = request.amount_in_cents.to_string();
        let mut params = vec![
            ("public-key", self.public_key.as_str()),
            ("currency", request.currency.as_str()),
            ("amount-in-cents", amount.as_str()),
            ("reference", request.reference.as_str()),
            ("customer-data:email", request.customer_email.as_str()),
        ];
        if let Some(redirect) = &request.redirect_url {
            params.push(("redirect-url", redirect.as_str()));
        }
        let mut url = self.checkout_url.clone();
        url.query_pairs_mut().extend_pairs(params);
        Ok(url.into())
    }
}

/// Client for the marketplace backend (order confirmation and pricing).
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: parse_base(base_url)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        parse_base(&format!("{}/{}", base, path.trim_start_matches('/')))
    }
}

#[async_trait]
impl OrderConfirmer for HttpBackend {
    async fn confirm_order(&self, order_id: &str, transaction_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&format!("orders/{}/confirm-payment", order_id))?)
            .json(&json!({ "transaction_id": transaction_id }))
            .send()
            .await?;
        let _: serde_json::Value = read_json(response).await?;
        Ok(())
    }
}

#[async_trait]
impl PricingQuoter for HttpBackend {
    async fn quote(
        &self,
        service_price: Decimal,
        margin_percent: Decimal,
    ) -> Result<PricingBreakdown> {
        let response = self
            .client
            .post(self.endpoint("pricing/quote")?)
            .json(&json!({
                "service_price": service_price,
                "margin_percent": margin_percent,
            }))
            .send()
            .await?;
        read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_url_encodes_params() {
        let gateway = HttpGateway::new(
            "https://sandbox.gateway.test/v1",
            "https://checkout.gateway.test/p/",
            "pub_test_abc",
        )
        .unwrap();
        let url = gateway
            .checkout_url(&CheckoutRequest {
                reference: "order 7".to_string(),
                amount_in_cents: 10707209,
                currency: "COP".to_string(),
                customer_email: "ana@example.com".to_string(),
                redirect_url: Some("https://app.test/pay/result?order=7".to_string()),
            })
            .unwrap();

        assert!(url.starts_with("https://checkout.gateway.test/p/?public-key=pub_test_abc"));
        assert!(url.contains("amount-in-cents=10707209"));
        assert!(url.contains("reference=order+7"));
        assert!(url.contains("redirect-url=https%3A%2F%2Fapp.test%2Fpay%2Fresult%3Forder%3D7"));
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let gateway = HttpGateway::new(
            "https://sandbox.gateway.test/v1/",
            "https://checkout.gateway.test/p/",
            "pub_test_abc",
        )
        .unwrap();
        assert_eq!(
            gateway.endpoint("/transactions/abc").unwrap().as_str(),
            "https://sandbox.gateway.test/v1/transactions/abc"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpBackend::new("not a url"),
            Err(PaymentError::Validation(_))
        ));
    }

    #[test]
    fn test_transaction_data_extracts_redirect() {
        let json = r#"{
            "id": "15113-1",
            "status": "PENDING",
            "reference": "order-3",
            "payment_method": {
                "type": "PSE",
                "extra": { "async_payment_url": "https://bank.test/approve/1" }
            }
        }"#;
        let data: TransactionData = serde_json::from_str(json).unwrap();
        let tx: GatewayTransaction = data.into();
        assert_eq!(tx.status, GatewayStatus::Pending);
        assert_eq!(tx.redirect_url.as_deref(), Some("https://bank.test/approve/1"));
    }

    #[test]
    fn test_error_reason() {
        let body = r#"{"error":{"type":"NOT_FOUND_ERROR","reason":"Transaction not found"}}"#;
        assert_eq!(error_reason(body).as_deref(), Some("Transaction not found"));
        assert_eq!(error_reason("plain text"), None);
    }
}
