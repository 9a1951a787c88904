use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub type MerchantId = Uuid;
pub type InvoiceId = Uuid;

/// Fractional digits that are meaningful on a given chain. USDT on
/// Ethereum and TRON carries 6 decimals; the BSC token carries 18.
pub const DEFAULT_NETWORK_PRECISION: u32 = 6;

pub fn network_precision(network: Option<&str>) -> u32 {
    match network.map(|n| n.to_ascii_uppercase()) {
        Some(n) => match n.as_str() {
            "ERC20" | "ETH" => 6,
            "TRC20" | "TRON" => 6,
            "BEP20" | "BSC" => 18,
            _ => DEFAULT_NETWORK_PRECISION,
        },
        None => DEFAULT_NETWORK_PRECISION,
    }
}

/// Confirmation depth required before a deposit may settle an invoice.
/// The fallback comes from configuration (DEFAULT_CONFIRMATIONS).
pub fn required_confirmations(network: Option<&str>, fallback: i32) -> i32 {
    match network.map(|n| n.to_ascii_uppercase()) {
        Some(n) => match n.as_str() {
            "ERC20" | "ETH" => 12,
            "BEP20" | "BSC" => 3,
            "TRC20" | "TRON" => 20,
            _ => fallback,
        },
        None => fallback,
    }
}

#[derive(Debug, Error)]
pub enum AmountDiffError {
    /// The network cannot represent a delta in the reserved digit range:
    /// quantising to `precision` digits would erase part of the k-digit delta.
    #[error("network precision {precision} cannot hold {k} reserved digits")]
    PrecisionOutOfRange { precision: u32, k: u32 },
    #[error("reserved digit count {0} out of supported range")]
    UnsupportedK(u32),
}

/// Deterministic invoice index in `[0, 10^k)` derived from the invoice id.
pub fn invoice_index(invoice_id: InvoiceId, k: u32) -> u128 {
    if k == 0 {
        return 0;
    }
    invoice_id.as_u128() % 10u128.pow(k)
}

/// Delta encoded into the k least-significant published digits,
/// e.g. k=3 yields increments of 0.001.
pub fn compute_delta(invoice_id: InvoiceId, k: u32) -> Result<Decimal, AmountDiffError> {
    if k > 18 {
        return Err(AmountDiffError::UnsupportedK(k));
    }
    let idx = invoice_index(invoice_id, k);
    Ok(Decimal::from_i128_with_scale(idx as i128, k))
}

/// Published amount for an invoice: base + delta, quantised toward zero at
/// the network's precision. Pure and deterministic; identical inputs yield
/// bit-identical output.
pub fn adjusted_amount_for_invoice(
    base_amount: Decimal,
    invoice_id: InvoiceId,
    network: Option<&str>,
    k: u32,
) -> Result<Decimal, AmountDiffError> {
    let precision = network_precision(network);
    if precision < k {
        return Err(AmountDiffError::PrecisionOutOfRange { precision, k });
    }
    let delta = compute_delta(invoice_id, k)?;
    let raw = base_amount + delta;
    Ok(raw.round_dp_with_strategy(precision, RoundingStrategy::ToZero))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
    PendingManualResolution,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Expired => "expired",
            InvoiceStatus::PendingManualResolution => "pending_manual_resolution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "expired" => Some(InvoiceStatus::Expired),
            "pending_manual_resolution" => Some(InvoiceStatus::PendingManualResolution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Success,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Success => "success",
            WebhookStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub merchant_id: MerchantId,
    pub publish_amount: Decimal,
    pub currency: String,
    pub network: Option<String>,
    pub address: Option<String>,
    pub address_tag: Option<String>,
    pub status: InvoiceStatus,
    pub metadata: Option<Value>,
    pub expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Deposit record as returned by the exchange's deposit-history endpoint.
/// `amount` arrives as a string decimal; `insertTime`/`completeTime` are
/// epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDeposit {
    #[serde(rename = "txId")]
    pub tx_id: String,
    pub coin: String,
    #[serde(default)]
    pub network: Option<String>,
    pub amount: Decimal,
    pub status: i32,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(rename = "addressTag", default)]
    pub address_tag: Option<String>,
    #[serde(rename = "insertTime")]
    pub insert_time_ms: i64,
    #[serde(rename = "completeTime", default)]
    pub complete_time_ms: Option<i64>,
    #[serde(rename = "confirmTimes", default)]
    pub confirm_times: i32,
}

/// A `deposit_raw` row: the exchange record verbatim plus the processed bit.
#[derive(Debug, Clone)]
pub struct DepositRecord {
    pub id: Uuid,
    pub tx_id: String,
    pub coin: String,
    pub network: Option<String>,
    pub amount: Decimal,
    pub status: i32,
    pub address: Option<String>,
    pub address_tag: Option<String>,
    pub insert_time_ms: i64,
    pub complete_time_ms: Option<i64>,
    pub raw: Value,
    pub processed: bool,
}

impl DepositRecord {
    /// Confirmation count as reported by the exchange, read out of the raw
    /// payload since the hisrec schema has grown fields over time.
    pub fn confirmations(&self) -> i32 {
        self.raw
            .get("confirmTimes")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32
    }
}

/// A due `webhook_queue` row joined with the owning merchant's endpoint.
#[derive(Debug, Clone)]
pub struct WebhookJob {
    pub id: Uuid,
    pub merchant_id: Option<MerchantId>,
    pub payload: Value,
    pub attempts: i32,
    pub idempotency_key: Option<String>,
    pub webhook_url: Option<String>,
}

/// Durable poller position: high-water insert time plus the last tx id as an
/// anti-duplicate sentinel (the tx_id unique index is authoritative).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerCheckpoint {
    pub key: String,
    pub last_insert_time_ms: Option<i64>,
    pub last_tx_id: Option<String>,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
