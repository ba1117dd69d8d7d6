use crate::config::PayHeroConfig;
use crate::error::GatewayError;
use crate::models::payment::{PaymentRequest, PaymentResult, PaymentStatus};
use async_trait::async_trait;
use bingwa_shared::payhero::{StkPushRequest, StkPushResponse, TransactionStatusResponse};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Sends one STK push. Makes exactly one outbound call and never retries.
    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentResult, GatewayError>;

    /// Looks up the settlement of an earlier push by our reference.
    async fn status(&self, reference: &str) -> Result<PaymentResult, GatewayError>;

    fn name(&self) -> &str;
}

#[derive(Clone)]
pub struct PayHeroGateway {
    client: Client,
    config: PayHeroConfig,
}

impl PayHeroGateway {
    pub fn new(config: PayHeroConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// The configured callback URL with `token` appended when a callback token is set.
    fn callback_url(&self) -> String {
        let base = &self.config.callback_url;
        let Some(token) = self.config.callback_token.as_deref() else {
            return base.clone();
        };
        match reqwest::Url::parse(base) {
            Ok(mut url) => {
                if !url.query_pairs().any(|(k, _)| k == "token") {
                    url.query_pairs_mut().append_pair("token", token);
                }
                url.to_string()
            }
            Err(e) => {
                warn!("PAYHERO_CALLBACK_URL is not a valid URL ({}); sending it unchanged", e);
                base.clone()
            }
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!("PayHero error body: {}", body);
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl PaymentGateway for PayHeroGateway {
    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentResult, GatewayError> {
        let body = StkPushRequest {
            amount: request.amount,
            phone_number: request.phone.to_string(),
            channel_id: self.config.channel_id,
            provider: "m-pesa".to_string(),
            external_reference: request.reference.clone(),
            callback_url: self.callback_url(),
        };

        info!(
            "Initiating STK push: amount={}, phone={}, ref={}",
            request.amount, request.phone, request.reference
        );

        let resp = self
            .client
            .post(self.url("/api/v2/payments"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&body)
            .send()
            .await?;
        info!("STK push response status: {}", resp.status());

        let resp = Self::check_status(resp).await?;
        let parsed: StkPushResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("undecodable reply: {}", e)))?;
        debug!("STK push response: {:?}", parsed);

        if !parsed.success {
            let reason = parsed
                .error_message
                .unwrap_or_else(|| "request not accepted".to_string());
            warn!("STK push declined for {}: {}", request.reference, reason);
            return Err(GatewayError::Rejected(reason));
        }

        Ok(PaymentResult {
            status: map_status(parsed.status.as_deref()),
            transaction_reference: parsed
                .reference
                .or(parsed.checkout_request_id)
                .unwrap_or_else(|| request.reference.clone()),
        })
    }

    async fn status(&self, reference: &str) -> Result<PaymentResult, GatewayError> {
        let resp = self
            .client
            .get(self.url("/api/v2/transaction-status"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[("reference", reference)])
            .send()
            .await?;

        let resp = Self::check_status(resp).await?;
        let parsed: TransactionStatusResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("undecodable reply: {}", e)))?;

        Ok(PaymentResult {
            status: map_status(parsed.status.as_deref()),
            transaction_reference: parsed
                .provider_reference
                .or(parsed.third_party_reference)
                .or(parsed.reference)
                .unwrap_or_else(|| reference.to_string()),
        })
    }

    fn name(&self) -> &str {
        "payhero"
    }
}

fn map_status(status: Option<&str>) -> PaymentStatus {
    match status.map(str::to_ascii_uppercase).as_deref() {
        Some("SUCCESS") => PaymentStatus::Success,
        Some("FAILED") | Some("CANCELLED") => PaymentStatus::Failed,
        _ => PaymentStatus::Initiated,
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        GatewayError::Timeout
    } else if status.is_client_error() {
        let reason = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error_message")
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("HTTP {}", status));
        GatewayError::Rejected(reason)
    } else {
        GatewayError::Unavailable(format!("HTTP {}", status))
    }
}
