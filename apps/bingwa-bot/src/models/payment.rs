use crate::phone::Msisdn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REFERENCE_PREFIX: &str = "BINGWA";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub amount: u32,
    pub phone: Msisdn,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// STK push accepted; the customer has not finished on the handset yet.
    Initiated,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    pub status: PaymentStatus,
    pub transaction_reference: String,
}

/// Settlement reported by the gateway after the fact, keyed by our reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOutcome {
    pub reference: String,
    pub success: bool,
    pub transaction_reference: Option<String>,
    pub description: Option<String>,
    /// Shillings the provider says were paid, when it reports them.
    pub amount: Option<f64>,
}

impl From<bingwa_shared::payhero::CallbackPayload> for PaymentOutcome {
    fn from(payload: bingwa_shared::payhero::CallbackPayload) -> Self {
        let success = payload.response.is_success();
        let r = payload.response;
        Self {
            reference: r.external_reference,
            success,
            transaction_reference: r.mpesa_receipt_number.or(r.checkout_request_id),
            description: r.result_desc,
            amount: r.amount,
        }
    }
}

/// Unique per confirmation, so a manual retry never reuses a reference.
pub fn generate_reference(now: DateTime<Utc>) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", REFERENCE_PREFIX, now.format("%Y%m%d%H%M%S"), &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_unique_within_one_second() {
        let now = Utc::now();
        let a = generate_reference(now);
        let b = generate_reference(now);
        assert_ne!(a, b);
        assert!(a.starts_with("BINGWA-"));
        assert_eq!(a.len(), "BINGWA-".len() + 14 + 1 + 8);
    }

    #[test]
    fn callback_prefers_mpesa_receipt() {
        let payload: bingwa_shared::payhero::CallbackPayload = serde_json::from_value(serde_json::json!({
            "status": true,
            "response": {
                "CheckoutRequestID": "ws_CO_1",
                "ExternalReference": "BINGWA-1",
                "MpesaReceiptNumber": "TX123",
                "ResultCode": 0,
                "Amount": 20
            }
        }))
        .unwrap();

        let outcome = PaymentOutcome::from(payload);
        assert!(outcome.success);
        assert_eq!(outcome.reference, "BINGWA-1");
        assert_eq!(outcome.transaction_reference.as_deref(), Some("TX123"));
        assert_eq!(outcome.amount, Some(20.0));
    }
}
