use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use payrail_core::WebhookJob;
use payrail_crypto::sign_webhook;
use payrail_metrics::{WEBHOOK_FAIL, WEBHOOK_SUCCESS};
use payrail_storage::PgStore;
use sqlx::Row;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);
/// Pause between deliveries when the queue still has due work.
const DRAIN_THROTTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub poll_interval: Duration,
    pub max_attempts: i32,
    pub backoff_base_seconds: i64,
    pub secret: String,
}

/// Retry delay before the next attempt: BASE doubled per prior attempt,
/// capped at 600 s.
pub fn retry_backoff_seconds(base_seconds: i64, attempts: i32) -> i64 {
    let exponent = (attempts - 1).clamp(0, 16) as u32;
    base_seconds.saturating_mul(1i64 << exponent).min(600)
}

pub struct WebhookWorker {
    store: PgStore,
    http: reqwest::Client,
    cfg: WebhookConfig,
}

impl WebhookWorker {
    pub fn new(store: PgStore, cfg: WebhookConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self { store, http, cfg })
    }

    /// Long-running dispatch loop; at-least-once delivery. Exits when the
    /// shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let sleep = match self.deliver_next().await {
                Ok(true) => DRAIN_THROTTLE,
                Ok(false) => self.cfg.poll_interval,
                Err(e) => {
                    error!(error = %e, "webhook iteration failed");
                    self.cfg.poll_interval
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("webhook worker stopped");
        Ok(())
    }

    /// Claim the oldest due pending row with SKIP LOCKED so concurrent
    /// workers never double-deliver, hold the row lock across the HTTP call,
    /// and record the outcome in the same transaction.
    pub async fn deliver_next(&self) -> Result<bool> {
        let mut tx = self.store.pool().begin().await?;
        let row = sqlx::query(
            "SELECT wq.id, wq.merchant_id, wq.payload, wq.attempts, wq.idempotency_key,
                    m.webhook_url
             FROM webhook_queue wq
             LEFT JOIN merchants m ON m.id = wq.merchant_id
             WHERE wq.status = 'pending'
               AND (wq.next_attempt_at IS NULL OR wq.next_attempt_at <= now())
             ORDER BY wq.created_at ASC
             LIMIT 1
             FOR UPDATE OF wq SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let job = WebhookJob {
            id: row.try_get("id")?,
            merchant_id: row.try_get("merchant_id")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            idempotency_key: row.try_get("idempotency_key")?,
            webhook_url: row.try_get("webhook_url")?,
        };

        let attempts = job.attempts + 1;
        match self.deliver(&job).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE webhook_queue SET status = 'success', attempts = $2, last_error = NULL
                     WHERE id = $1",
                )
                .bind(job.id)
                .bind(attempts)
                .execute(&mut *tx)
                .await?;
                WEBHOOK_SUCCESS.inc();
                info!(webhook_id = %job.id, attempts, "webhook delivered");
            }
            Err(reason) => {
                WEBHOOK_FAIL.inc();
                if attempts >= self.cfg.max_attempts {
                    sqlx::query(
                        "UPDATE webhook_queue SET status = 'failed', attempts = $2, last_error = $3
                         WHERE id = $1",
                    )
                    .bind(job.id)
                    .bind(attempts)
                    .bind(&reason)
                    .execute(&mut *tx)
                    .await?;
                    error!(webhook_id = %job.id, attempts, %reason, "webhook permanently failed");
                } else {
                    let backoff = retry_backoff_seconds(self.cfg.backoff_base_seconds, attempts);
                    let next_attempt_at = Utc::now() + chrono::Duration::seconds(backoff);
                    sqlx::query(
                        "UPDATE webhook_queue
                         SET status = 'pending', attempts = $2, last_error = $3, next_attempt_at = $4
                         WHERE id = $1",
                    )
                    .bind(job.id)
                    .bind(attempts)
                    .bind(&reason)
                    .bind(next_attempt_at)
                    .execute(&mut *tx)
                    .await?;
                    warn!(webhook_id = %job.id, attempts, backoff_s = backoff, %reason, "webhook retry scheduled");
                }
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Signed POST to the merchant endpoint. 2xx is success; everything else
    /// becomes the retry reason.
    async fn deliver(&self, job: &WebhookJob) -> Result<(), String> {
        let url = job
            .webhook_url
            .as_deref()
            .ok_or_else(|| "no_webhook_url".to_string())?;
        let payload_bytes = serde_json::to_vec(&job.payload).map_err(|e| e.to_string())?;
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_webhook(&payload_bytes, &timestamp, &self.cfg.secret);

        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-PS-Timestamp", &timestamp)
            .header("X-PS-Signature", &signature)
            .body(payload_bytes);
        if let Some(key) = &job.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let resp = request.send().await.map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("status_{}", resp.status().as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Router};
    use payrail_crypto::verify_webhook;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn backoff_schedule_doubles_to_cap() {
        assert_eq!(retry_backoff_seconds(1, 1), 1);
        assert_eq!(retry_backoff_seconds(1, 2), 2);
        assert_eq!(retry_backoff_seconds(1, 4), 8);
        assert_eq!(retry_backoff_seconds(1, 10), 512);
        assert_eq!(retry_backoff_seconds(1, 11), 600);
        assert_eq!(retry_backoff_seconds(5, 1), 5);
        assert_eq!(retry_backoff_seconds(5, 8), 600);
    }

    struct MockState {
        status: AtomicU16,
        secret: String,
    }

    async fn mock_endpoint(
        State(state): State<Arc<MockState>>,
        headers: HeaderMap,
        body: axum::body::Bytes,
    ) -> axum::http::StatusCode {
        let ts = headers
            .get("X-PS-Timestamp")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let sig = headers
            .get("X-PS-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_webhook(&body, ts, &state.secret, sig) {
            return axum::http::StatusCode::UNAUTHORIZED;
        }
        axum::http::StatusCode::from_u16(state.status.load(Ordering::Relaxed)).unwrap()
    }

    async fn start_mock(secret: &str, initial_status: u16) -> (SocketAddr, Arc<MockState>) {
        let state = Arc::new(MockState {
            status: AtomicU16::new(initial_status),
            secret: secret.to_string(),
        });
        let app = Router::new()
            .route("/hook", post(mock_endpoint))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn test_store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL for test");
        let store = PgStore::connect(&url, 5).await.unwrap();
        // The worker always claims the oldest due row; park anything left
        // behind by other suites so each test only sees its own queue entry.
        sqlx::query("UPDATE webhook_queue SET status = 'failed', last_error = 'parked_by_test' WHERE status = 'pending'")
            .execute(store.pool())
            .await
            .unwrap();
        store
    }

    fn worker(store: PgStore, secret: &str) -> WebhookWorker {
        WebhookWorker::new(
            store,
            WebhookConfig {
                poll_interval: Duration::from_secs(2),
                max_attempts: 3,
                backoff_base_seconds: 1,
                secret: secret.to_string(),
            },
        )
        .unwrap()
    }

    async fn enqueue(store: &PgStore, merchant: Uuid) -> Uuid {
        sqlx::query_scalar(
            "INSERT INTO webhook_queue(merchant_id, payload, status, idempotency_key)
             VALUES ($1, $2, 'pending', $3) RETURNING id",
        )
        .bind(merchant)
        .bind(serde_json::json!({"invoiceId": Uuid::new_v4(), "status": "paid"}))
        .bind(Uuid::new_v4().to_string())
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    // Postgres-backed delivery tests; run with `cargo test -- --ignored`.

    #[tokio::test]
    #[ignore]
    async fn failed_delivery_schedules_retry_then_succeeds() {
        let secret = "wh-secret";
        let (addr, mock) = start_mock(secret, 500).await;
        let store = test_store().await;
        let merchant = store
            .insert_merchant("m-webhook", Some(&format!("http://{addr}/hook")))
            .await
            .unwrap();
        let id = enqueue(&store, merchant).await;
        let w = worker(store.clone(), secret);

        assert!(w.deliver_next().await.unwrap());
        let row = sqlx::query("SELECT status, attempts, last_error, next_attempt_at FROM webhook_queue WHERE id = $1")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        let status: String = row.get("status");
        let attempts: i32 = row.get("attempts");
        let last_error: Option<String> = row.get("last_error");
        assert_eq!(status, "pending");
        assert_eq!(attempts, 1);
        assert_eq!(last_error.as_deref(), Some("status_500"));

        // Make the row due immediately and let the endpoint recover.
        sqlx::query("UPDATE webhook_queue SET next_attempt_at = now() - interval '1 second' WHERE id = $1")
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();
        mock.status.store(200, Ordering::Relaxed);

        assert!(w.deliver_next().await.unwrap());
        let row = sqlx::query("SELECT status, attempts, last_error FROM webhook_queue WHERE id = $1")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        let status: String = row.get("status");
        let attempts: i32 = row.get("attempts");
        let last_error: Option<String> = row.get("last_error");
        assert_eq!(status, "success");
        assert_eq!(attempts, 2);
        assert!(last_error.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn attempts_cap_marks_failed() {
        let secret = "wh-secret";
        let (addr, _mock) = start_mock(secret, 500).await;
        let store = test_store().await;
        let merchant = store
            .insert_merchant("m-webhook-cap", Some(&format!("http://{addr}/hook")))
            .await
            .unwrap();
        let id = enqueue(&store, merchant).await;
        let w = worker(store.clone(), secret);

        for _ in 0..3 {
            sqlx::query("UPDATE webhook_queue SET next_attempt_at = NULL WHERE id = $1")
                .bind(id)
                .execute(store.pool())
                .await
                .unwrap();
            assert!(w.deliver_next().await.unwrap());
        }
        let row = sqlx::query("SELECT status, attempts FROM webhook_queue WHERE id = $1")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        let status: String = row.get("status");
        let attempts: i32 = row.get("attempts");
        assert_eq!(status, "failed");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    #[ignore]
    async fn missing_webhook_url_counts_as_attempt() {
        let store = test_store().await;
        let merchant = store.insert_merchant("m-webhook-nourl", None).await.unwrap();
        let id = enqueue(&store, merchant).await;
        let w = worker(store.clone(), "wh-secret");

        assert!(w.deliver_next().await.unwrap());
        let row = sqlx::query("SELECT status, attempts, last_error FROM webhook_queue WHERE id = $1")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        let status: String = row.get("status");
        let last_error: Option<String> = row.get("last_error");
        assert_eq!(status, "pending");
        assert_eq!(last_error.as_deref(), Some("no_webhook_url"));
    }
}
