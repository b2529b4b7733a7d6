//! Mock payment backend over HTTP
//!
//! Serves an `InMemoryBackend` so a payer and a payee on two machines can
//! exercise the full flow: create a payment, redeem the token a microphone
//! picked up, settle it, and watch the payer's status polls flip.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use soundpay_core::{BackendError, InMemoryBackend, PaymentBackend, Token};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone)]
pub struct AppState {
    backend: InMemoryBackend,
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    pub store_id: String,
    /// Minor currency units
    pub amount: u64,
}

struct ApiError(StatusCode, String);

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        let status = match e {
            BackendError::NotFound(_) => StatusCode::NOT_FOUND,
            BackendError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BackendError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

pub fn router(backend: InMemoryBackend) -> Router {
    Router::new()
        .route("/payments", post(create_payment))
        .route("/payments/{id}", get(payment_status))
        .route("/payments/{id}/settle", post(settle_payment))
        .route("/redeem/{token}", get(redeem_token))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %Uuid::new_v4(),
            )
        }))
        .layer(CorsLayer::permissive())
        .with_state(AppState { backend })
}

async fn create_payment(
    State(state): State<AppState>,
    Json(body): Json<CreatePaymentBody>,
) -> std::result::Result<Response, ApiError> {
    let reference = state.backend.create_payment(&body.store_id, body.amount).await?;
    tracing::info!(payment_id = %reference.payment_id, token = %reference.token, "Payment created");
    Ok((StatusCode::CREATED, Json(reference)).into_response())
}

async fn payment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let report = state.backend.payment_status(&id).await?;
    Ok(Json(report).into_response())
}

async fn settle_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let settlement = state.backend.settle(&id)?;
    tracing::info!(payment_id = %id, transaction_ref = %settlement.transaction_ref, "Payment settled");
    Ok(Json(settlement).into_response())
}

async fn redeem_token(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let token = Token::parse(&raw).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    let payment = state.backend.redeem(&token).await?;
    Ok(Json(payment).into_response())
}

pub async fn serve(addr: SocketAddr, backend: InMemoryBackend) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Mock payment backend listening on {}", listener.local_addr()?);
    axum::serve(listener, router(backend))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_payment_flow() {
        let backend = InMemoryBackend::new();
        let app = router(backend.clone());

        let (status, created) = call(
            app.clone(),
            "POST",
            "/payments",
            Some(json!({ "store_id": "store-9", "amount": 700 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["payment_id"].as_str().unwrap().to_string();
        let token = created["token"].as_str().unwrap().to_string();
        assert!(token.starts_with("PAY_"));

        let (status, redeemed) = call(app.clone(), "GET", &format!("/redeem/{}", token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(redeemed["payment_id"], id.as_str());
        assert_eq!(redeemed["amount"], 700);

        let (_, pending) = call(app.clone(), "GET", &format!("/payments/{}", id), None).await;
        assert_eq!(pending["status"], "pending");

        let (status, _) = call(app.clone(), "POST", &format!("/payments/{}/settle", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, paid) = call(app, "GET", &format!("/payments/{}", id), None).await;
        assert_eq!(paid["status"], "paid");
        assert_eq!(paid["settlement"]["amount"], 700);
    }

    #[tokio::test]
    async fn test_unknown_payment_is_404() {
        let app = router(InMemoryBackend::new());
        let (status, body) = call(app, "GET", "/payments/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_malformed_token_is_400() {
        let app = router(InMemoryBackend::new());
        let (status, _) = call(app, "GET", "/redeem/PAY", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let app = router(InMemoryBackend::new());
        let (status, _) = call(
            app,
            "POST",
            "/payments",
            Some(json!({ "store_id": "s", "amount": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
