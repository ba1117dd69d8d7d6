use serde::{Deserialize, Serialize};

/// PayHero v2 wire types
pub mod payhero {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct StkPushRequest {
        pub amount: u32,
        pub phone_number: String,
        pub channel_id: u32,
        pub provider: String,
        pub external_reference: String,
        pub callback_url: String,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct StkPushResponse {
        #[serde(default)]
        pub success: bool,
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default)]
        pub reference: Option<String>,
        #[serde(rename = "CheckoutRequestID", default)]
        pub checkout_request_id: Option<String>,
        #[serde(default)]
        pub error_message: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct TransactionStatusResponse {
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default)]
        pub reference: Option<String>,
        #[serde(default)]
        pub provider_reference: Option<String>,
        #[serde(default)]
        pub third_party_reference: Option<String>,
    }

    /// Body PayHero posts to the callback URL once the STK push settles.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CallbackPayload {
        #[serde(default)]
        pub status: bool,
        pub response: CallbackResponse,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct CallbackResponse {
        #[serde(default)]
        pub amount: Option<f64>,
        #[serde(rename = "CheckoutRequestID", default)]
        pub checkout_request_id: Option<String>,
        pub external_reference: String,
        #[serde(default)]
        pub mpesa_receipt_number: Option<String>,
        #[serde(default)]
        pub phone: Option<String>,
        #[serde(default)]
        pub result_code: Option<i64>,
        #[serde(default)]
        pub result_desc: Option<String>,
        #[serde(default)]
        pub status: Option<String>,
    }

    impl CallbackResponse {
        pub fn is_success(&self) -> bool {
            match (self.result_code, self.status.as_deref()) {
                (Some(code), _) => code == 0,
                (None, Some(status)) => status.eq_ignore_ascii_case("success"),
                (None, None) => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::payhero::*;

    #[test]
    fn callback_parses_payhero_body() {
        let body = serde_json::json!({
            "status": true,
            "response": {
                "Amount": 20,
                "CheckoutRequestID": "ws_CO_1",
                "ExternalReference": "BINGWA-20240101120000-abcd1234",
                "MpesaReceiptNumber": "TX123",
                "Phone": "+254712345678",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "Status": "Success"
            }
        });

        let payload: CallbackPayload = serde_json::from_value(body).unwrap();
        assert_eq!(payload.response.external_reference, "BINGWA-20240101120000-abcd1234");
        assert_eq!(payload.response.mpesa_receipt_number.as_deref(), Some("TX123"));
        assert!(payload.response.is_success());
    }

    #[test]
    fn cancelled_callback_is_not_success() {
        let body = serde_json::json!({
            "status": false,
            "response": {
                "ExternalReference": "BINGWA-x",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user",
                "Status": "Failed"
            }
        });

        let payload: CallbackPayload = serde_json::from_value(body).unwrap();
        assert!(!payload.response.is_success());
    }
}
