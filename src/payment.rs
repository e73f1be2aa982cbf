//! Payment gateway collaborator.
//!
//! The gateways themselves (bKash, Nagad, Rocket, SSLCommerz) are external;
//! the core only needs `initiate(amount, reference)` to hand back a payment
//! URL for the `PAYMENT_REQUIRED` response. Webhook processing is out of
//! scope.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PaymentInitiation {
    pub payment_url: String,
    pub reference_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Start a payment for `amount_bdt`. Returns the redirect URL the client
    /// should complete the payment at.
    async fn initiate(&self, amount_bdt: i64, reference_id: &str)
        -> anyhow::Result<PaymentInitiation>;
}

/// HTTP-backed gateway. Posts `{amount, reference_id}` to the configured
/// base URL and expects `{payment_url, reference_id}` back.
pub struct HttpPaymentGateway {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    payment_url: String,
    #[serde(default)]
    reference_id: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(name: String, base_url: String, client: reqwest::Client) -> Self {
        Self { name, base_url, client }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initiate(
        &self,
        amount_bdt: i64,
        reference_id: &str,
    ) -> anyhow::Result<PaymentInitiation> {
        let url = format!("{}/initiate", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "amount": amount_bdt,
            "reference_id": reference_id,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<InitiateResponse>()
            .await?;

        Ok(PaymentInitiation {
            payment_url: response.payment_url,
            reference_id: response.reference_id.unwrap_or_else(|| reference_id.to_string()),
        })
    }
}

/// Used when no gateway is configured; `initiate` fails so callers fall back
/// to a plain `INSUFFICIENT_FUNDS` error without a payment URL.
pub struct DisabledPaymentGateway;

#[async_trait]
impl PaymentGateway for DisabledPaymentGateway {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn initiate(
        &self,
        _amount_bdt: i64,
        reference_id: &str,
    ) -> anyhow::Result<PaymentInitiation> {
        warn!(reference_id, "Payment gateway not configured; cannot initiate payment");
        anyhow::bail!("payment gateway not configured")
    }
}
