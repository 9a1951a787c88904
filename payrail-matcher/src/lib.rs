use anyhow::{bail, Result};
use payrail_core::{
    adjusted_amount_for_invoice, required_confirmations, AmountDiffError, DepositRecord,
    ExchangeDeposit, Invoice, InvoiceStatus,
};
use payrail_metrics::{COLLISIONS, DEPOSITS_PROCESSED};
use payrail_storage::invoice_from_row;
use rust_decimal::Decimal;
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on open invoices considered per deposit.
const MAX_CANDIDATES: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Not a USDT deposit; nothing to do.
    Ignored,
    /// Success status not reached or confirmations below the network
    /// requirement; the deposit stays unprocessed for a later poll.
    NotReady,
    /// No pending invoice matched; later invoices may still claim it.
    NoMatch,
    Credited {
        payment_id: Uuid,
        used_amount_diff: bool,
    },
    /// Two or more invoices map to the same published amount; all were
    /// escalated to manual resolution and the deposit left unprocessed.
    Collision { invoice_ids: Vec<Uuid> },
}

/// Idempotent insert into deposit_raw keyed by tx_id. Returns the stored
/// record and whether this call created it.
pub async fn ingest_deposit(
    tx: &mut Transaction<'_, Postgres>,
    deposit: &ExchangeDeposit,
) -> Result<(DepositRecord, bool)> {
    if deposit.tx_id.is_empty() {
        bail!("deposit missing txId");
    }
    let raw = serde_json::to_value(deposit)?;
    let inserted = sqlx::query(
        "INSERT INTO deposit_raw(tx_id, coin, network, amount, status, address, address_tag, insert_time_ms, complete_time_ms, raw)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT (tx_id) DO NOTHING
         RETURNING *",
    )
    .bind(&deposit.tx_id)
    .bind(&deposit.coin)
    .bind(&deposit.network)
    .bind(deposit.amount)
    .bind(deposit.status)
    .bind(&deposit.address)
    .bind(&deposit.address_tag)
    .bind(deposit.insert_time_ms)
    .bind(deposit.complete_time_ms)
    .bind(&raw)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = inserted {
        return Ok((deposit_from_row(&row)?, true));
    }
    let existing = sqlx::query("SELECT * FROM deposit_raw WHERE tx_id = $1")
        .bind(&deposit.tx_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok((deposit_from_row(&existing)?, false))
}

/// Re-observation of a deposit that is already ingested but not yet
/// processed (e.g. it was below the confirmation requirement last poll).
/// Updates the mutable exchange fields so a new match attempt sees the
/// current confirmation count. Returns None once the row is processed.
pub async fn refresh_deposit(
    tx: &mut Transaction<'_, Postgres>,
    deposit: &ExchangeDeposit,
) -> Result<Option<DepositRecord>> {
    let raw = serde_json::to_value(deposit)?;
    let row = sqlx::query(
        "UPDATE deposit_raw SET status = $2, complete_time_ms = $3, raw = $4
         WHERE tx_id = $1 AND processed = false
         RETURNING *",
    )
    .bind(&deposit.tx_id)
    .bind(deposit.status)
    .bind(deposit.complete_time_ms)
    .bind(&raw)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(deposit_from_row).transpose()
}

fn deposit_from_row(row: &sqlx::postgres::PgRow) -> Result<DepositRecord> {
    Ok(DepositRecord {
        id: row.try_get("id")?,
        tx_id: row.try_get("tx_id")?,
        coin: row.try_get("coin")?,
        network: row.try_get("network")?,
        amount: row.try_get("amount")?,
        status: row.try_get("status")?,
        address: row.try_get("address")?,
        address_tag: row.try_get("address_tag")?,
        insert_time_ms: row.try_get("insert_time_ms")?,
        complete_time_ms: row.try_get("complete_time_ms")?,
        raw: row.try_get("raw")?,
        processed: row.try_get("processed")?,
    })
}

/// Exchange deposit status code meaning the deposit landed.
const DEPOSIT_STATUS_SUCCESS: i32 = 1;

pub fn deposit_is_ready(status: i32, confirmations: i32, required: i32) -> bool {
    status == DEPOSIT_STATUS_SUCCESS && confirmations >= required
}

/// Candidates whose amount-differentiated published amount equals the
/// deposited amount. More than one element is a collision.
pub fn amount_diff_matches<'a>(
    candidates: &'a [Invoice],
    amount: Decimal,
    k: u32,
) -> Result<Vec<&'a Invoice>, AmountDiffError> {
    let mut matches = Vec::new();
    for candidate in candidates {
        let adjusted = adjusted_amount_for_invoice(
            candidate.publish_amount,
            candidate.id,
            candidate.network.as_deref(),
            k,
        )?;
        if adjusted == amount {
            matches.push(candidate);
        }
    }
    Ok(matches)
}

/// Decide what to do with a freshly ingested deposit: credit an invoice,
/// escalate a collision, or leave it unprocessed. Must be called within the
/// transaction that ingested the row; all writes commit together with it.
pub async fn try_match_and_credit(
    tx: &mut Transaction<'_, Postgres>,
    deposit: &DepositRecord,
    k: u32,
    default_confirmations: i32,
) -> Result<MatchOutcome> {
    if !deposit.coin.eq_ignore_ascii_case("USDT") {
        info!(tx_id = %deposit.tx_id, coin = %deposit.coin, "ignoring non-USDT deposit");
        return Ok(MatchOutcome::Ignored);
    }

    let confirmations = deposit.confirmations();
    let required = required_confirmations(deposit.network.as_deref(), default_confirmations);
    if deposit.status == DEPOSIT_STATUS_SUCCESS && confirmations == 0 {
        warn!(tx_id = %deposit.tx_id, "deposit reports success with zero confirmations");
    }
    if !deposit_is_ready(deposit.status, confirmations, required) {
        info!(
            tx_id = %deposit.tx_id,
            status = deposit.status,
            confirmations,
            required,
            "deposit not ready"
        );
        return Ok(MatchOutcome::NotReady);
    }

    let Some(address) = deposit.address.as_deref() else {
        info!(tx_id = %deposit.tx_id, "deposit carries no address");
        return Ok(MatchOutcome::NoMatch);
    };

    let mut query = String::from(
        "SELECT * FROM invoices
         WHERE address = $1 AND network IS NOT DISTINCT FROM $2 AND status = 'pending'",
    );
    if deposit.address_tag.is_some() {
        query.push_str(" AND address_tag = $4");
    }
    query.push_str(" LIMIT $3");
    let mut stmt = sqlx::query(&query)
        .bind(address)
        .bind(&deposit.network)
        .bind(MAX_CANDIDATES);
    if let Some(tag) = &deposit.address_tag {
        stmt = stmt.bind(tag);
    }
    let rows = stmt.fetch_all(&mut **tx).await?;
    let candidates = rows
        .iter()
        .map(invoice_from_row)
        .collect::<Result<Vec<_>>>()?;
    if candidates.is_empty() {
        info!(tx_id = %deposit.tx_id, "no invoice candidates");
        return Ok(MatchOutcome::NoMatch);
    }

    // Exact pass: published amount equals the deposited amount.
    for candidate in &candidates {
        let locked = lock_invoice(tx, candidate.id).await?;
        if locked.status != InvoiceStatus::Pending {
            continue;
        }
        if locked.publish_amount == deposit.amount {
            let payment_id = credit_invoice(tx, &locked, deposit, confirmations, false).await?;
            DEPOSITS_PROCESSED.inc();
            return Ok(MatchOutcome::Credited {
                payment_id,
                used_amount_diff: false,
            });
        }
    }

    // Amount-differentiation fallback.
    let matches = amount_diff_matches(&candidates, deposit.amount, k)?;
    match matches.len() {
        1 => {
            let locked = lock_invoice(tx, matches[0].id).await?;
            if locked.status != InvoiceStatus::Pending {
                info!(tx_id = %deposit.tx_id, "matched invoice no longer pending");
                return Ok(MatchOutcome::NoMatch);
            }
            let payment_id = credit_invoice(tx, &locked, deposit, confirmations, true).await?;
            DEPOSITS_PROCESSED.inc();
            Ok(MatchOutcome::Credited {
                payment_id,
                used_amount_diff: true,
            })
        }
        0 => {
            info!(tx_id = %deposit.tx_id, "no amount-diff match");
            Ok(MatchOutcome::NoMatch)
        }
        _ => {
            let invoice_ids: Vec<Uuid> = matches.iter().map(|m| m.id).collect();
            COLLISIONS.inc();
            warn!(tx_id = %deposit.tx_id, ?invoice_ids, "amount-diff collision");
            for id in &invoice_ids {
                lock_invoice(tx, *id).await?;
                sqlx::query("UPDATE invoices SET status = 'pending_manual_resolution' WHERE id = $1")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
            let details = serde_json::json!({
                "tx": deposit.tx_id,
                "matches": invoice_ids,
            });
            sqlx::query("INSERT INTO audit_logs(actor, action, details) VALUES ($1, $2, $3)")
                .bind("poller")
                .bind("collision_detected")
                .bind(&details)
                .execute(&mut **tx)
                .await?;
            sqlx::query("INSERT INTO system_events(source, event_type, payload) VALUES ($1, $2, $3)")
                .bind("poller")
                .bind("collision")
                .bind(&details)
                .execute(&mut **tx)
                .await?;
            // deposit_raw.processed stays false for the operator.
            Ok(MatchOutcome::Collision { invoice_ids })
        }
    }
}

async fn lock_invoice(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Invoice> {
    let row = sqlx::query("SELECT * FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    invoice_from_row(&row)
}

/// The atomic credit: payment, ledger entry, invoice paid, deposit marked
/// processed, webhook enqueued. Caller holds the invoice row lock.
async fn credit_invoice(
    tx: &mut Transaction<'_, Postgres>,
    invoice: &Invoice,
    deposit: &DepositRecord,
    confirmations: i32,
    used_amount_diff: bool,
) -> Result<Uuid> {
    let payment_metadata = serde_json::json!({ "used_amount_diff": used_amount_diff });
    let row = sqlx::query(
        "INSERT INTO payments(invoice_id, deposit_raw_id, tx_id, amount, network, address, address_tag, status, metadata)
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'settled', $8) RETURNING id",
    )
    .bind(invoice.id)
    .bind(deposit.id)
    .bind(&deposit.tx_id)
    .bind(deposit.amount)
    .bind(&deposit.network)
    .bind(&deposit.address)
    .bind(&deposit.address_tag)
    .bind(&payment_metadata)
    .fetch_one(&mut **tx)
    .await?;
    let payment_id: Uuid = row.try_get("id")?;

    let ledger_metadata = serde_json::json!({
        "invoice_id": invoice.id,
        "tx_id": deposit.tx_id,
        "confirmations": confirmations,
    });
    sqlx::query(
        "INSERT INTO ledger_entries(merchant_id, change_amount, currency, entry_type, reference_id, metadata)
         VALUES ($1, $2, 'USDT', 'credit_invoice', $3, $4)",
    )
    .bind(invoice.merchant_id)
    .bind(deposit.amount)
    .bind(payment_id)
    .bind(&ledger_metadata)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE invoices SET status = 'paid' WHERE id = $1")
        .bind(invoice.id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE deposit_raw SET processed = true WHERE id = $1")
        .bind(deposit.id)
        .execute(&mut **tx)
        .await?;

    let payload = serde_json::json!({
        "invoiceId": invoice.id,
        "merchantId": invoice.merchant_id,
        "status": "paid",
        "amount": deposit.amount.to_string(),
        "network": deposit.network,
        "txHash": deposit.tx_id,
        "confirmations": confirmations,
        "confirmedAt": deposit.complete_time_ms,
        "metadata": { "used_amount_diff": used_amount_diff },
    });
    sqlx::query(
        "INSERT INTO webhook_queue(merchant_id, payload, status, idempotency_key)
         VALUES ($1, $2, 'pending', $3)",
    )
    .bind(invoice.merchant_id)
    .bind(&payload)
    .bind(payment_id.to_string())
    .execute(&mut **tx)
    .await?;

    info!(
        tx_id = %deposit.tx_id,
        invoice_id = %invoice.id,
        %payment_id,
        used_amount_diff,
        "credited invoice"
    );
    Ok(payment_id)
}
