use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use payrail_core::{now_ms, ExchangeDeposit};
use payrail_crypto::sign_exchange_query;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("exchange returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("missing exchange credentials")]
    MissingCredentials,
}

impl ExchangeError {
    /// Server-side failures are transient and retried at the outer loop.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Transport(_) => true,
            ExchangeError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Deterministic signed query: keys joined lexicographically, then the
/// HMAC appended as the trailing signature parameter.
pub fn signed_query(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let qs = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let signature = sign_exchange_query(&qs, api_secret);
    format!("{qs}&signature={signature}")
}

#[derive(Deserialize)]
struct ServerTime {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

/// Client for the exchange's signed REST endpoints. Owns the server-time
/// offset; safe to share across tasks. Secrets are injected at construction
/// and never logged.
pub struct BinanceClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    http: reqwest::Client,
    time_offset_ms: AtomicI64,
}

impl BinanceClient {
    pub fn new(api_key: &str, api_secret: &str, base_url: &str) -> Result<Self, ExchangeError> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(ExchangeError::MissingCredentials);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            time_offset_ms: AtomicI64::new(0),
        })
    }

    /// Fetch server time and record `server - local` in milliseconds.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let url = format!("{}/api/v3/time", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp).await?;
        let data: ServerTime = resp.json().await?;
        let offset = data.server_time - now_ms();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "synced exchange server time");
        Ok(offset)
    }

    /// Local clock adjusted by the last known server offset.
    pub fn now_ms(&self) -> i64 {
        now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    pub async fn get_deposit_history(
        &self,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ExchangeDeposit>, ExchangeError> {
        let mut params: Vec<(&str, String)> = vec![
            ("limit", limit.to_string()),
            ("timestamp", self.now_ms().to_string()),
        ];
        if let Some(start) = start_time_ms {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time_ms {
            params.push(("endTime", end.to_string()));
        }
        let qs = signed_query(&params, &self.api_secret);
        let url = format!("{}/sapi/v1/capital/deposit/hisrec?{qs}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::InvalidResponse(format!("deposit history decode: {e}")))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ExchangeError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_query_sorts_keys_lexicographically() {
        let params = [
            ("timestamp", "1670000300000".to_string()),
            ("limit", "200".to_string()),
            ("startTime", "1670000000000".to_string()),
        ];
        let qs = signed_query(&params, "secret");
        let expected_base = "limit=200&startTime=1670000000000&timestamp=1670000300000";
        assert!(qs.starts_with(&format!("{expected_base}&signature=")));
        let sig = qs.rsplit("signature=").next().unwrap();
        assert_eq!(sig, sign_exchange_query(expected_base, "secret"));
    }

    #[test]
    fn signed_query_is_deterministic() {
        let params = [("limit", "100".to_string()), ("timestamp", "1".to_string())];
        assert_eq!(signed_query(&params, "s"), signed_query(&params, "s"));
    }

    #[test]
    fn offset_shifts_adjusted_clock() {
        let client = BinanceClient::new("k", "s", DEFAULT_BASE_URL).unwrap();
        client.time_offset_ms.store(5_000, Ordering::Relaxed);
        let local = now_ms();
        let adjusted = client.now_ms();
        assert!(adjusted - local >= 4_900 && adjusted - local <= 5_100);
    }

    #[test]
    fn empty_credentials_are_rejected() {
        assert!(matches!(
            BinanceClient::new("", "s", DEFAULT_BASE_URL),
            Err(ExchangeError::MissingCredentials)
        ));
        assert!(matches!(
            BinanceClient::new("k", "", DEFAULT_BASE_URL),
            Err(ExchangeError::MissingCredentials)
        ));
    }
}
