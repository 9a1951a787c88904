use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use payrail_config::Settings;
use payrail_core::Invoice;
use payrail_invoice::{create_invoice, CreateInvoiceRequest, InvoiceError};
use payrail_storage::PgStore;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub const SERVICE_NAME: &str = "payrail-backend";

#[derive(Clone)]
pub struct ApiState {
    pub store: PgStore,
    pub settings: Arc<Settings>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/ready", get(ready))
        .route("/api/invoices", post(create_invoice_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: &str, state: ApiState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("api listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

/// Liveness: always 200, touches no dependency.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn check_redis(url: Option<&str>) -> (bool, Option<String>) {
    let Some(url) = url else {
        return (false, Some("REDIS_URL not configured".to_string()));
    };
    let result = async {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok::<_, redis::RedisError>(())
    }
    .await;
    match result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    }
}

/// Readiness: verifies database and cache connectivity; 503 with dependency
/// detail when either is unreachable.
async fn ready(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let (db_ok, db_err) = match state.store.ping().await {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };
    let (redis_ok, redis_err) = check_redis(state.settings.redis_url.as_deref()).await;
    let healthy = db_ok && redis_ok;
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "dependencies": {
            "database": { "ok": db_ok, "error": db_err },
            "redis": { "ok": redis_ok, "error": redis_err },
        },
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub invoice_id: Uuid,
    pub publish_amount: Decimal,
    pub currency: String,
    pub network: Option<String>,
    pub address: Option<String>,
    pub address_tag: Option<String>,
    pub status: String,
}

impl From<Invoice> for InvoiceResponse {
    fn from(invoice: Invoice) -> Self {
        Self {
            invoice_id: invoice.id,
            publish_amount: invoice.publish_amount,
            currency: invoice.currency,
            network: invoice.network,
            address: invoice.address,
            address_tag: invoice.address_tag,
            status: invoice.status.as_str().to_string(),
        }
    }
}

/// HTTP mapping for creation failures. Callers only ever see 409 for an
/// exhausted collision or an opaque 500; internal detail never leaks.
pub fn invoice_error_status(err: &InvoiceError) -> (StatusCode, &'static str) {
    match err {
        InvoiceError::CollisionExhausted { .. } => {
            (StatusCode::CONFLICT, "invoice_creation_collision")
        }
        InvoiceError::NonPositiveAmount
        | InvoiceError::AmountDiff(_)
        | InvoiceError::Storage(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "invoice_creation_failed")
        }
    }
}

async fn create_invoice_handler(
    State(state): State<ApiState>,
    Json(req): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceResponse>), (StatusCode, Json<Value>)> {
    let settings = &state.settings;
    match create_invoice(
        &state.store,
        &req,
        settings.amount_diff_k,
        settings.invoice_creation_max_attempts,
    )
    .await
    {
        Ok(invoice) => Ok((StatusCode::CREATED, Json(invoice.into()))),
        Err(err) => {
            let (code, detail) = invoice_error_status(&err);
            if code == StatusCode::INTERNAL_SERVER_ERROR {
                error!(error = %err, "invoice creation failed");
            }
            Err((code, Json(json!({ "detail": detail }))))
        }
    }
}
