use anyhow::Result;
use chrono::{DateTime, Utc};
use payrail_core::{Invoice, InvoiceStatus, MerchantId, PollerCheckpoint};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Row};
use tracing::info;
use uuid::Uuid;

/// Postgres unique-violation SQLSTATE. Conflicts on the partial unique index
/// and on deposit tx_id are normal control flow, not failures.
pub const UNIQUE_VIOLATION: &str = "23505";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS merchants(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    name TEXT NOT NULL,
    webhook_url TEXT,
    risk_tier TEXT NOT NULL DEFAULT 'low',
    onboarding_status TEXT NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS api_keys(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    merchant_id UUID NOT NULL REFERENCES merchants(id) ON DELETE CASCADE,
    key_id TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_used_at TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_api_keys_key_id ON api_keys(key_id);
CREATE TABLE IF NOT EXISTS invoices(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    merchant_id UUID NOT NULL REFERENCES merchants(id) ON DELETE CASCADE,
    publish_amount NUMERIC(36,18) NOT NULL,
    currency TEXT NOT NULL DEFAULT 'USDT',
    network TEXT,
    address TEXT,
    address_tag TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    metadata JSONB,
    expiry TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_invoices_merchant ON invoices(merchant_id);
CREATE INDEX IF NOT EXISTS idx_invoices_address ON invoices(address);
CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status);
CREATE INDEX IF NOT EXISTS idx_invoices_address_network_tag ON invoices(address, network, address_tag);
CREATE UNIQUE INDEX IF NOT EXISTS ux_invoices_merchant_amount_address
    ON invoices(merchant_id, publish_amount, address) WHERE address IS NOT NULL;
CREATE TABLE IF NOT EXISTS deposit_addresses(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    merchant_id UUID REFERENCES merchants(id) ON DELETE SET NULL,
    invoice_id UUID REFERENCES invoices(id) ON DELETE SET NULL,
    address TEXT NOT NULL,
    network TEXT,
    allocated BOOLEAN NOT NULL DEFAULT false,
    metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_deposit_addresses_address_network
    ON deposit_addresses(address, network);
CREATE INDEX IF NOT EXISTS idx_deposit_addresses_merchant ON deposit_addresses(merchant_id);
CREATE TABLE IF NOT EXISTS poller_checkpoints(
    key TEXT PRIMARY KEY,
    last_insert_time_ms BIGINT,
    last_tx_id TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS deposit_raw(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    tx_id TEXT NOT NULL,
    coin TEXT NOT NULL,
    network TEXT,
    amount NUMERIC(36,18) NOT NULL,
    status INTEGER NOT NULL,
    address TEXT,
    address_tag TEXT,
    insert_time_ms BIGINT NOT NULL,
    complete_time_ms BIGINT,
    raw JSONB NOT NULL,
    processed BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_deposit_raw_txid ON deposit_raw(tx_id);
CREATE INDEX IF NOT EXISTS idx_deposit_raw_address ON deposit_raw(address);
CREATE INDEX IF NOT EXISTS idx_deposit_raw_processed ON deposit_raw(processed);
CREATE TABLE IF NOT EXISTS payments(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    invoice_id UUID NOT NULL REFERENCES invoices(id) ON DELETE CASCADE,
    deposit_raw_id UUID REFERENCES deposit_raw(id) ON DELETE SET NULL,
    tx_id TEXT,
    amount NUMERIC(36,18) NOT NULL,
    network TEXT,
    address TEXT,
    address_tag TEXT,
    status TEXT NOT NULL DEFAULT 'settled',
    metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_payments_txid_invoice ON payments(tx_id, invoice_id);
CREATE INDEX IF NOT EXISTS idx_payments_invoice ON payments(invoice_id);
CREATE TABLE IF NOT EXISTS ledger_entries(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    merchant_id UUID NOT NULL REFERENCES merchants(id) ON DELETE CASCADE,
    change_amount NUMERIC(36,18) NOT NULL,
    currency TEXT NOT NULL DEFAULT 'USDT',
    entry_type TEXT NOT NULL,
    reference_id UUID,
    metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_ledger_merchant ON ledger_entries(merchant_id);
CREATE INDEX IF NOT EXISTS idx_ledger_created_at ON ledger_entries(created_at);
CREATE TABLE IF NOT EXISTS webhook_queue(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    merchant_id UUID REFERENCES merchants(id) ON DELETE SET NULL,
    payload JSONB NOT NULL,
    headers JSONB,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    idempotency_key TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    next_attempt_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_webhook_queue_status ON webhook_queue(status);
CREATE INDEX IF NOT EXISTS idx_webhook_queue_merchant ON webhook_queue(merchant_id);
CREATE TABLE IF NOT EXISTS audit_logs(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    actor TEXT,
    action TEXT NOT NULL,
    details JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs(created_at);
CREATE TABLE IF NOT EXISTS system_events(
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    source TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_system_events_source ON system_events(source);

CREATE OR REPLACE FUNCTION payrail_reject_mutation() RETURNS trigger AS $fn$
BEGIN
    RAISE EXCEPTION '% is append-only', TG_TABLE_NAME;
END;
$fn$ LANGUAGE plpgsql;
DROP TRIGGER IF EXISTS ledger_entries_append_only ON ledger_entries;
CREATE TRIGGER ledger_entries_append_only
    BEFORE UPDATE OR DELETE ON ledger_entries
    FOR EACH ROW EXECUTE FUNCTION payrail_reject_mutation();
DROP TRIGGER IF EXISTS audit_logs_append_only ON audit_logs;
CREATE TRIGGER audit_logs_append_only
    BEFORE UPDATE OR DELETE ON audit_logs
    FOR EACH ROW EXECUTE FUNCTION payrail_reject_mutation();
"#;

/// Outcome of an invoice insert attempted against the partial unique index
/// on (merchant_id, publish_amount, address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Conflict,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        self.pool.execute(SCHEMA_SQL).await?;
        info!("schema bootstrap complete");
        Ok(())
    }

    /// Lightweight connectivity probe used by the readiness endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_merchant(&self, name: &str, webhook_url: Option<&str>) -> Result<MerchantId> {
        let row = sqlx::query("INSERT INTO merchants(name, webhook_url) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(webhook_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    /// Single-statement invoice insert. A unique violation on the partial
    /// index is reported as `Conflict` so the creator can probe the next
    /// candidate id.
    #[allow(clippy::too_many_arguments)]
    pub async fn try_insert_invoice(
        &self,
        id: Uuid,
        merchant_id: MerchantId,
        publish_amount: Decimal,
        currency: &str,
        network: Option<&str>,
        address: Option<&str>,
        address_tag: Option<&str>,
        status: InvoiceStatus,
        metadata: Option<&Value>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<InsertOutcome> {
        let res = sqlx::query(
            "INSERT INTO invoices(id, merchant_id, publish_amount, currency, network, address, address_tag, status, metadata, expiry)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(id)
        .bind(merchant_id)
        .bind(publish_amount)
        .bind(currency)
        .bind(network)
        .bind(address)
        .bind(address_tag)
        .bind(status.as_str())
        .bind(metadata)
        .bind(expiry)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Ok(InsertOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Escalation path when candidate probing exhausts: record the invoice
    /// under manual resolution together with one audit log and one system
    /// event, all in a single transaction. The address column stays NULL —
    /// the bare base amount may still occupy the unique triple — so the
    /// requested address travels in the metadata for the operator.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_manual_resolution_invoice(
        &self,
        merchant_id: MerchantId,
        base_amount: Decimal,
        currency: &str,
        network: Option<&str>,
        address: Option<&str>,
        address_tag: Option<&str>,
        metadata: Value,
    ) -> Result<Uuid> {
        let mut metadata = metadata;
        if let Value::Object(map) = &mut metadata {
            map.insert("requested_address".into(), serde_json::json!(address));
            map.insert("requested_address_tag".into(), serde_json::json!(address_tag));
        }
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO invoices(merchant_id, publish_amount, currency, network, status, metadata)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(merchant_id)
        .bind(base_amount)
        .bind(currency)
        .bind(network)
        .bind(InvoiceStatus::PendingManualResolution.as_str())
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await?;
        let invoice_id: Uuid = row.try_get("id")?;
        let details = serde_json::json!({
            "merchant_id": merchant_id,
            "base_amount": base_amount.to_string(),
            "invoice_id": invoice_id,
        });
        sqlx::query("INSERT INTO audit_logs(actor, action, details) VALUES ($1, $2, $3)")
            .bind("invoice_service")
            .bind("invoice_creation_collision_exhausted")
            .bind(&details)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO system_events(source, event_type, payload) VALUES ($1, $2, $3)")
            .bind("invoice_service")
            .bind("collision_exhausted")
            .bind(&details)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(invoice_id)
    }

    pub async fn fetch_invoice(&self, id: Uuid) -> Result<Option<Invoice>> {
        let row = sqlx::query("SELECT * FROM invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| invoice_from_row(&r)).transpose()
    }

    /// Janitor pass: pending invoices past their expiry move to `expired`.
    /// Returns the number of transitioned rows.
    pub async fn expire_invoices(&self) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE invoices SET status = 'expired'
             WHERE status = 'pending' AND expiry IS NOT NULL AND expiry < now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn load_checkpoint(&self, key: &str) -> Result<Option<PollerCheckpoint>> {
        let row = sqlx::query(
            "SELECT key, last_insert_time_ms, last_tx_id FROM poller_checkpoints WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| PollerCheckpoint {
            key: r.get("key"),
            last_insert_time_ms: r.get("last_insert_time_ms"),
            last_tx_id: r.get("last_tx_id"),
        }))
    }
}

pub fn invoice_from_row(row: &PgRow) -> Result<Invoice> {
    let status_text: String = row.try_get("status")?;
    let status = InvoiceStatus::parse(&status_text)
        .ok_or_else(|| anyhow::anyhow!("unknown invoice status {status_text:?}"))?;
    Ok(Invoice {
        id: row.try_get("id")?,
        merchant_id: row.try_get("merchant_id")?,
        publish_amount: row.try_get("publish_amount")?,
        currency: row.try_get("currency")?,
        network: row.try_get("network")?,
        address: row.try_get("address")?,
        address_tag: row.try_get("address_tag")?,
        status,
        metadata: row.try_get("metadata")?,
        expiry: row.try_get("expiry")?,
        created_at: row.try_get("created_at")?,
    })
}
