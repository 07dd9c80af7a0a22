//! Mesh HMAC-like token: a non-cryptographic FNV-1a hash over
//! `"<timestamp>:<secret>"`, explicitly scoped to LAN trust rather than
//! claiming cryptographic resistance. The shape is
//! `"<ms_timestamp>:<16-hex-digest>"`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::util::fnv1a_hex;

/// Default replay window: a token minted up to this many milliseconds in
/// the past still verifies. Chosen generously since this is explicitly LAN
/// trust, not a security boundary.
pub const DEFAULT_WINDOW_MS: u64 = 5 * 60 * 1000;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

fn digest(timestamp_ms: u64, secret: &str) -> String {
    fnv1a_hex(format!("{timestamp_ms}:{secret}").as_bytes())
}

/// Mints `"<ms_timestamp>:<16-hex-digest>"` for the current time.
pub fn mint(secret: &str) -> String {
    mint_at(now_ms(), secret)
}

pub fn mint_at(timestamp_ms: u64, secret: &str) -> String {
    format!("{timestamp_ms}:{}", digest(timestamp_ms, secret))
}

/// Recomputes the digest and compares; also enforces a replay window so a
/// captured token can't be replayed indefinitely. This is a LAN-trust
/// tolerance, not a cryptographic guarantee.
pub fn verify(token: &str, secret: &str) -> bool {
    verify_at(token, secret, now_ms(), DEFAULT_WINDOW_MS)
}

pub fn verify_at(token: &str, secret: &str, now_ms: u64, window_ms: u64) -> bool {
    let Some((ts_str, digest_str)) = token.split_once(':') else {
        return false;
    };
    let Ok(ts) = ts_str.parse::<u64>() else {
        return false;
    };
    if now_ms.saturating_sub(ts) > window_ms {
        return false;
    }
    digest(ts, secret) == digest_str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_succeeds_within_window() {
        let token = mint_at(1_000_000, "shared-secret");
        assert!(verify_at(&token, "shared-secret", 1_000_500, DEFAULT_WINDOW_MS));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let token = mint_at(1_000_000, "shared-secret");
        assert!(!verify_at(&token, "other-secret", 1_000_500, DEFAULT_WINDOW_MS));
    }

    #[test]
    fn verify_rejects_outside_replay_window() {
        let token = mint_at(1_000_000, "shared-secret");
        assert!(!verify_at(&token, "shared-secret", 1_000_000 + 999_999, DEFAULT_WINDOW_MS));
    }

    #[test]
    fn verify_rejects_malformed_token() {
        assert!(!verify_at("not-a-token", "shared-secret", now_ms(), DEFAULT_WINDOW_MS));
    }
}
