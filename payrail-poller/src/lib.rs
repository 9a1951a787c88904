use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use payrail_core::{now_ms, ExchangeDeposit};
use payrail_exchange::BinanceClient;
use payrail_matcher::{ingest_deposit, refresh_deposit, try_match_and_credit};
use payrail_metrics::{DEPOSITS_ERRORS, POLLER_LAST_SUCCESS};
use payrail_storage::PgStore;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const CHECKPOINT_KEY: &str = "binance_deposit";
/// Records requested per window; the exchange caps the endpoint at 1000.
pub const MAX_LIMIT: u32 = 200;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub window_ms: i64,
    pub initial_lookback_ms: i64,
    pub amount_diff_k: u32,
    pub default_confirmations: i32,
}

/// Fixed-size ingestion windows covering `[start_ms, end_ms]` inclusive.
pub fn windows(start_ms: i64, end_ms: i64, window_ms: i64) -> Vec<(i64, i64)> {
    let mut out = Vec::new();
    let mut window_start = start_ms;
    while window_start < end_ms {
        let window_end = (window_start + window_ms - 1).min(end_ms);
        out.push((window_start, window_end));
        window_start = window_end + 1;
    }
    out
}

/// Outer-loop backoff: doubles per consecutive failure, capped at 300 s.
pub fn poll_backoff_seconds(consecutive_errors: u32) -> u64 {
    (1u64 << consecutive_errors.min(9)).min(300)
}

pub struct PollerService {
    client: BinanceClient,
    store: PgStore,
    cfg: PollerConfig,
}

impl PollerService {
    pub fn new(client: BinanceClient, store: PgStore, cfg: PollerConfig) -> Self {
        Self { client, store, cfg }
    }

    /// Long-running poll loop. Exits when the shutdown signal flips; any
    /// in-flight deposit transaction has committed or rolled back by then.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut consecutive_errors: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let sleep = match self.run_cycle().await {
                Ok(()) => {
                    consecutive_errors = 0;
                    POLLER_LAST_SUCCESS.set(Utc::now().timestamp());
                    self.cfg.poll_interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = poll_backoff_seconds(consecutive_errors);
                    error!(error = %e, consecutive_errors, backoff_s = backoff, "poll cycle failed");
                    Duration::from_secs(backoff)
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
        info!("poller stopped");
        Ok(())
    }

    /// One full pass: expiry janitor, time sync, then the window walk from
    /// the checkpoint up to the exchange's current time.
    async fn run_cycle(&self) -> Result<()> {
        let expired = self.store.expire_invoices().await?;
        if expired > 0 {
            info!(expired, "expired stale invoices");
        }

        if let Err(e) = self.client.sync_time().await {
            warn!(error = %e, "time sync failed, continuing with last known offset");
        }

        let checkpoint = self.store.load_checkpoint(CHECKPOINT_KEY).await?;
        let start_ms = checkpoint
            .and_then(|c| c.last_insert_time_ms)
            .unwrap_or_else(|| now_ms() - self.cfg.initial_lookback_ms);
        let end_ms = self.client.now_ms();
        for (window_start, window_end) in windows(start_ms, end_ms, self.cfg.window_ms) {
            self.run_window(window_start, window_end).await?;
        }
        Ok(())
    }

    /// One ingestion window: fetch, order ascending by insert time, process
    /// each deposit in its own transaction.
    pub async fn run_window(&self, start_ms: i64, end_ms: i64) -> Result<()> {
        let mut deposits = self
            .client
            .get_deposit_history(Some(start_ms), Some(end_ms), MAX_LIMIT)
            .await?;
        if deposits.is_empty() {
            return Ok(());
        }
        deposits.sort_by_key(|d| d.insert_time_ms);
        for deposit in &deposits {
            if let Err(e) = self.process_deposit(deposit).await {
                DEPOSITS_ERRORS.inc();
                error!(tx_id = %deposit.tx_id, error = %e, "deposit processing failed");
            }
        }
        Ok(())
    }

    /// One deposit, one transaction: idempotent ingest, a match attempt for
    /// new or still-unprocessed rows, and the checkpoint advance. All of it
    /// commits or rolls back together.
    async fn process_deposit(&self, deposit: &ExchangeDeposit) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        let (record, inserted) = ingest_deposit(&mut tx, deposit).await?;
        if inserted {
            try_match_and_credit(
                &mut tx,
                &record,
                self.cfg.amount_diff_k,
                self.cfg.default_confirmations,
            )
            .await?;
        } else if !record.processed {
            if let Some(refreshed) = refresh_deposit(&mut tx, deposit).await? {
                try_match_and_credit(
                    &mut tx,
                    &refreshed,
                    self.cfg.amount_diff_k,
                    self.cfg.default_confirmations,
                )
                .await?;
            }
        }
        sqlx::query(
            "INSERT INTO poller_checkpoints(key, last_insert_time_ms, last_tx_id, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (key) DO UPDATE
             SET last_insert_time_ms = EXCLUDED.last_insert_time_ms,
                 last_tx_id = EXCLUDED.last_tx_id,
                 updated_at = now()",
        )
        .bind(CHECKPOINT_KEY)
        .bind(record.insert_time_ms)
        .bind(&record.tx_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_cover_range_without_overlap() {
        let w = windows(0, 1_000, 300);
        assert_eq!(w, vec![(0, 299), (300, 599), (600, 899), (900, 1_000)]);
        for pair in w.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn windows_empty_when_caught_up() {
        assert!(windows(1_000, 1_000, 300).is_empty());
        assert!(windows(2_000, 1_000, 300).is_empty());
    }

    #[test]
    fn single_partial_window() {
        assert_eq!(windows(0, 100, 300), vec![(0, 100)]);
    }

    #[test]
    fn backoff_doubles_to_cap() {
        assert_eq!(poll_backoff_seconds(1), 2);
        assert_eq!(poll_backoff_seconds(2), 4);
        assert_eq!(poll_backoff_seconds(6), 64);
        assert_eq!(poll_backoff_seconds(8), 256);
        assert_eq!(poll_backoff_seconds(9), 300);
        assert_eq!(poll_backoff_seconds(40), 300);
    }

    // End-to-end window ingestion against Postgres plus a mock exchange;
    // run with `cargo test -- --ignored`.

    use axum::{extract::State as AxumState, routing::get, Json, Router};
    use payrail_core::{adjusted_amount_for_invoice, InvoiceStatus};
    use rust_decimal::Decimal;
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn start_mock_exchange(deposits: Vec<Value>) -> SocketAddr {
        let deposits = Arc::new(deposits);
        let app = Router::new()
            .route(
                "/api/v3/time",
                get(|| async { Json(serde_json::json!({ "serverTime": now_ms() })) }),
            )
            .route(
                "/sapi/v1/capital/deposit/hisrec",
                get(|AxumState(deps): AxumState<Arc<Vec<Value>>>| async move {
                    Json(deps.as_ref().clone())
                }),
            )
            .with_state(deposits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    #[ignore]
    async fn window_ingests_matches_and_is_replay_safe() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL for test");
        let store = PgStore::connect(&url, 5).await.unwrap();
        let merchant = store.insert_merchant("m-e2e", None).await.unwrap();
        let address = format!("0x{}", Uuid::new_v4().simple());
        let invoice_id = Uuid::new_v4();
        let base = Decimal::from_str("10.00").unwrap();
        let publish = adjusted_amount_for_invoice(base, invoice_id, Some("ERC20"), 3).unwrap();
        store
            .try_insert_invoice(
                invoice_id,
                merchant,
                publish,
                "USDT",
                Some("ERC20"),
                Some(&address),
                None,
                InvoiceStatus::Pending,
                None,
                None,
            )
            .await
            .unwrap();

        let insert_time = now_ms();
        let tx_id = format!("tx-e2e-{}", Uuid::new_v4().simple());
        let deposit = serde_json::json!({
            "txId": tx_id,
            "coin": "USDT",
            "network": "ERC20",
            "amount": publish.to_string(),
            "status": 1,
            "address": address,
            "addressTag": null,
            "insertTime": insert_time,
            "completeTime": insert_time,
            "confirmTimes": 12
        });
        let addr = start_mock_exchange(vec![deposit]).await;
        let client = BinanceClient::new("k", "s", &format!("http://{addr}")).unwrap();
        client.sync_time().await.unwrap();
        let poller = PollerService::new(
            client,
            store.clone(),
            PollerConfig {
                poll_interval: Duration::from_secs(1),
                window_ms: 300_000,
                initial_lookback_ms: 86_400_000,
                amount_diff_k: 3,
                default_confirmations: 2,
            },
        );

        poller
            .run_window(insert_time - 1_000, insert_time + 1_000)
            .await
            .unwrap();

        let invoice = store.fetch_invoice(invoice_id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        let payments: i64 = sqlx::query_scalar("SELECT count(*) FROM payments WHERE tx_id = $1")
            .bind(&tx_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(payments, 1);
        let checkpoint = store
            .load_checkpoint(CHECKPOINT_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_insert_time_ms, Some(insert_time));
        assert_eq!(checkpoint.last_tx_id, Some(tx_id.clone()));

        // Replaying the same window must not duplicate any settlement row.
        poller
            .run_window(insert_time - 1_000, insert_time + 1_000)
            .await
            .unwrap();
        let payments: i64 = sqlx::query_scalar("SELECT count(*) FROM payments WHERE tx_id = $1")
            .bind(&tx_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(payments, 1);
        let ledger: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM ledger_entries WHERE metadata->>'tx_id' = $1",
        )
        .bind(&tx_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(ledger, 1);
        let queued: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM webhook_queue WHERE payload->>'txHash' = $1",
        )
        .bind(&tx_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(queued, 1);
    }
}
