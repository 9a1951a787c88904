use chrono::{Duration, Utc};
use payrail_core::{adjusted_amount_for_invoice, AmountDiffError, Invoice, InvoiceStatus, MerchantId};
use payrail_storage::{InsertOutcome, PgStore};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoiceRequest {
    pub merchant_id: MerchantId,
    pub base_amount: Decimal,
    pub currency: Option<String>,
    pub network: Option<String>,
    pub address: Option<String>,
    pub address_tag: Option<String>,
    pub expiry_seconds: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Error)]
pub enum InvoiceError {
    /// Every candidate published amount collided with an open invoice. A
    /// manual-resolution invoice was recorded under `invoice_id`.
    #[error("invoice creation exhausted {attempts} candidate amounts")]
    CollisionExhausted { attempts: u32, invoice_id: Uuid },
    #[error("base_amount must be positive")]
    NonPositiveAmount,
    #[error(transparent)]
    AmountDiff(#[from] AmountDiffError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Candidate invoice id for a given probe attempt: the random 128-bit base
/// advanced by the attempt number, wrapping mod 2^128. Sequential candidates
/// land on distinct indices mod 10^k, so each probe tries a fresh delta.
pub fn candidate_id(base: u128, attempt: u32) -> Uuid {
    Uuid::from_u128(base.wrapping_add(attempt as u128))
}

pub async fn create_invoice(
    store: &PgStore,
    req: &CreateInvoiceRequest,
    k: u32,
    max_attempts: u32,
) -> Result<Invoice, InvoiceError> {
    if req.base_amount <= Decimal::ZERO {
        return Err(InvoiceError::NonPositiveAmount);
    }
    let currency = req.currency.as_deref().unwrap_or("USDT");
    let expiry = req
        .expiry_seconds
        .map(|secs| Utc::now() + Duration::seconds(secs));

    let base_id: u128 = rand::thread_rng().gen();
    for attempt in 0..max_attempts {
        let id = candidate_id(base_id, attempt);
        let publish_amount =
            adjusted_amount_for_invoice(req.base_amount, id, req.network.as_deref(), k)?;
        let outcome = store
            .try_insert_invoice(
                id,
                req.merchant_id,
                publish_amount,
                currency,
                req.network.as_deref(),
                req.address.as_deref(),
                req.address_tag.as_deref(),
                InvoiceStatus::Pending,
                req.metadata.as_ref(),
                expiry,
            )
            .await?;
        match outcome {
            InsertOutcome::Inserted => {
                info!(invoice_id = %id, merchant_id = %req.merchant_id, %publish_amount, "created invoice");
                let invoice = store
                    .fetch_invoice(id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("invoice {id} vanished after insert"))?;
                return Ok(invoice);
            }
            InsertOutcome::Conflict => {
                warn!(invoice_id = %id, attempt, "invoice creation collision, probing next candidate");
            }
        }
    }

    let invoice_id = store
        .create_manual_resolution_invoice(
            req.merchant_id,
            req.base_amount,
            currency,
            req.network.as_deref(),
            req.address.as_deref(),
            req.address_tag.as_deref(),
            serde_json::json!({ "note": "amount-diff-collision", "attempts": max_attempts }),
        )
        .await?;
    Err(InvoiceError::CollisionExhausted {
        attempts: max_attempts,
        invoice_id,
    })
}
