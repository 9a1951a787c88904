use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_SIGNATURE_PREFIX: &str = "sha256=";

/// Hex HMAC-SHA256 over the exchange query string. The caller appends the
/// result as `&signature=<hex>`.
pub fn sign_exchange_query(query_string: &str, api_secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(query_string.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Webhook signature over `<timestamp>.<payload>`, presented as
/// `sha256=<hex>` in the X-PS-Signature header.
pub fn sign_webhook(payload: &[u8], timestamp: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("{}{}", WEBHOOK_SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a `sha256=<hex>` webhook signature over the
/// same `<timestamp>.<payload>` material.
pub fn verify_webhook(payload: &[u8], timestamp: &str, secret: &str, signature: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix(WEBHOOK_SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_part) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    // verify_slice compares in constant time.
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_sign_verify_round_trip() {
        let payload = br#"{"invoiceId":"abc","status":"paid"}"#;
        let ts = "1700000000";
        let sig = sign_webhook(payload, ts, "topsecret");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), WEBHOOK_SIGNATURE_PREFIX.len() + 64);
        assert!(verify_webhook(payload, ts, "topsecret", &sig));
    }

    #[test]
    fn verify_rejects_any_tamper() {
        let payload = b"{\"amount\":\"10.123\"}";
        let ts = "1700000000";
        let secret = "topsecret";
        let sig = sign_webhook(payload, ts, secret);

        assert!(!verify_webhook(b"{\"amount\":\"10.124\"}", ts, secret, &sig));
        assert!(!verify_webhook(payload, "1700000001", secret, &sig));
        assert!(!verify_webhook(payload, ts, "othersecret", &sig));

        let mut flipped = sig.clone().into_bytes();
        let last = flipped.len() - 1;
        flipped[last] = if flipped[last] == b'0' { b'1' } else { b'0' };
        assert!(!verify_webhook(payload, ts, secret, &String::from_utf8(flipped).unwrap()));

        assert!(!verify_webhook(payload, ts, secret, "md5=deadbeef"));
        assert!(!verify_webhook(payload, ts, secret, "sha256=nothex"));
    }

    #[test]
    fn exchange_signature_is_deterministic_hex() {
        let qs = "limit=200&startTime=1670000000000&timestamp=1670000300000";
        let a = sign_exchange_query(qs, "secret");
        let b = sign_exchange_query(qs, "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, sign_exchange_query(qs, "secret2"));
    }
}
