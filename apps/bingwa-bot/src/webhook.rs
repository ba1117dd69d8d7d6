use crate::flow::ConversationFlow;
use crate::models::payment::PaymentOutcome;
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use bingwa_shared::payhero::CallbackPayload;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct WebhookState {
    pub flow: ConversationFlow,
    /// When set, callbacks must carry `?token=<value>`.
    pub callback_token: Option<Arc<str>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub fn routes(flow: ConversationFlow, callback_token: Option<String>) -> Router {
    let state = WebhookState {
        flow,
        callback_token: callback_token.map(Arc::from),
    };
    Router::new()
        .route("/health", get(health_check))
        .route("/payhero/callback", post(payhero_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> &'static str {
    "ok"
}

/// Authenticated callbacks are always acknowledged, so PayHero stops redelivering
/// even for references we drop.
pub async fn payhero_callback(
    State(state): State<WebhookState>,
    Query(query): Query<CallbackQuery>,
    Json(payload): Json<CallbackPayload>,
) -> Response {
    if let Some(expected) = state.callback_token.as_deref() {
        if query.token.as_deref() != Some(expected) {
            warn!(
                "Rejected PayHero callback for {} with a missing or wrong token",
                payload.response.external_reference
            );
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let outcome = PaymentOutcome::from(payload);
    info!(
        "PayHero callback for {} (success: {})",
        outcome.reference, outcome.success
    );
    let applied = state.flow.complete_payment(outcome).await;
    (StatusCode::OK, Json(json!({ "status": "ok", "applied": applied }))).into_response()
}

pub async fn serve(
    addr: SocketAddr,
    flow: ConversationFlow,
    callback_token: Option<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Payment callback server listening on {}", addr);
    axum::serve(listener, routes(flow, callback_token))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::flow::actions::{Action, InboundEvent};
    use crate::flow::FlowSettings;
    use crate::models::bundle::{Catalog, Validity};
    use crate::models::payment::{PaymentRequest, PaymentResult, PaymentStatus};
    use crate::models::session::FlowState;
    use crate::models::user::UserProfile;
    use crate::services::admin_service::AdminService;
    use crate::services::notification_service::testing::RecordingNotifier;
    use crate::services::pay_service::PaymentGateway;
    use crate::services::store_service::UserStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tower::ServiceExt;

    const CUSTOMER: i64 = 4242;

    /// Accepts every push and leaves it waiting for the handset.
    #[derive(Default)]
    struct QueuedGateway {
        references: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PaymentGateway for QueuedGateway {
        async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentResult, GatewayError> {
            self.references.lock().unwrap().push(request.reference.clone());
            Ok(PaymentResult {
                status: PaymentStatus::Initiated,
                transaction_reference: "ws_CO_191220191020363925".into(),
            })
        }

        async fn status(&self, _reference: &str) -> Result<PaymentResult, GatewayError> {
            Err(GatewayError::Unavailable("not scripted".into()))
        }

        fn name(&self) -> &str {
            "queued"
        }
    }

    struct Fixture {
        flow: ConversationFlow,
        gateway: Arc<QueuedGateway>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let config = crate::config::BotConfig::from_lookup(|key| match key {
            "BOT_TOKEN" => Some("123:abc".into()),
            "API_USERNAME" => Some("user".into()),
            "API_PASSWORD" => Some("pass".into()),
            _ => None,
        })
        .unwrap();
        let users = UserStore::in_memory();
        let admin = AdminService::new(HashSet::new(), users.clone(), 25, std::time::Duration::ZERO);
        let gateway = Arc::new(QueuedGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let flow = ConversationFlow::new(
            Arc::new(Catalog::default()),
            users,
            gateway.clone(),
            admin,
            notifier.clone(),
            FlowSettings::from_config(&config),
        );
        Fixture {
            flow,
            gateway,
            notifier,
        }
    }

    impl Fixture {
        /// Walks the customer to a pushed D1 payment and returns its reference.
        async fn pending_purchase(&self) -> String {
            let user = UserProfile {
                id: CUSTOMER,
                first_name: Some("Akinyi".into()),
                ..Default::default()
            };
            let steps = [
                InboundEvent::message(user.clone(), CUSTOMER, "/bundles", "bingwa_bot"),
                InboundEvent::callback(user.clone(), CUSTOMER, &Action::Category(Validity::Daily).encode()),
                InboundEvent::callback(user.clone(), CUSTOMER, &Action::Bundle("D1".into()).encode()),
                InboundEvent::message(user.clone(), CUSTOMER, "0712345678", "bingwa_bot"),
                InboundEvent::callback(user, CUSTOMER, &Action::Confirm.encode()),
            ];
            for event in steps {
                self.flow.handle(event).await;
            }
            assert_eq!(self.flow.state(CUSTOMER).await, FlowState::PaymentPending);
            self.gateway.references.lock().unwrap()[0].clone()
        }
    }

    fn callback_body(reference: &str) -> String {
        json!({
            "status": true,
            "response": {
                "Amount": 20,
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ExternalReference": reference,
                "MerchantRequestID": "3202-70921557-1",
                "MpesaReceiptNumber": "SLK4XYZ123",
                "Phone": "+254712345678",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "Status": "Success"
            }
        })
        .to_string()
    }

    fn post_callback(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_of(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = routes(fixture().flow, None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn callback_settles_a_pending_purchase() {
        let f = fixture();
        let reference = f.pending_purchase().await;

        let response = routes(f.flow.clone(), None)
            .oneshot(post_callback("/payhero/callback", callback_body(&reference)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["applied"], true);
        assert_eq!(f.flow.state(CUSTOMER).await, FlowState::Idle);
        assert_eq!(f.flow.pending_payments(), 0);
        let receipt = f.notifier.last_to(CUSTOMER).text;
        assert!(receipt.contains("SLK4XYZ123"));
        assert!(receipt.contains(&reference));
    }

    #[tokio::test]
    async fn redelivered_callback_is_acknowledged_but_not_applied() {
        let f = fixture();
        let reference = f.pending_purchase().await;
        let app = routes(f.flow.clone(), None);

        let first = app
            .clone()
            .oneshot(post_callback("/payhero/callback", callback_body(&reference)))
            .await
            .unwrap();
        assert_eq!(json_of(first).await["applied"], true);
        let delivered = f.notifier.messages_to(CUSTOMER).len();

        let again = app
            .oneshot(post_callback("/payhero/callback", callback_body(&reference)))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(json_of(again).await["applied"], false);
        assert_eq!(f.notifier.messages_to(CUSTOMER).len(), delivered);
    }

    #[tokio::test]
    async fn unknown_reference_is_acknowledged() {
        let response = routes(fixture().flow, None)
            .oneshot(post_callback(
                "/payhero/callback",
                callback_body("BINGWA-20240101000000-deadbeef"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["applied"], false);
    }

    #[tokio::test]
    async fn callback_without_the_token_is_refused() {
        let f = fixture();
        let reference = f.pending_purchase().await;
        let app = routes(f.flow.clone(), Some("s3cret".into()));

        for uri in ["/payhero/callback", "/payhero/callback?token=guess"] {
            let response = app
                .clone()
                .oneshot(post_callback(uri, callback_body(&reference)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        assert_eq!(f.flow.state(CUSTOMER).await, FlowState::PaymentPending);

        let response = app
            .oneshot(post_callback("/payhero/callback?token=s3cret", callback_body(&reference)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.flow.state(CUSTOMER).await, FlowState::Idle);
    }
}
