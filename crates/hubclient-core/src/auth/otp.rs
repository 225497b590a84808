//! Time-based one-time password derivation (RFC 6238, HMAC-SHA1, 6 digits).

use std::time::Duration;

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

const CODE_DIGITS: u32 = 6;

/// How far past the interval boundary a deferred derivation lands.
const BOUNDARY_MARGIN: Duration = Duration::from_secs(1);

/// Decode a base32 seed, tolerating spaces, lowercase and padding.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.is_empty() {
        return Err(Error::InvalidOtpSecret("empty secret".to_string()));
    }

    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::InvalidOtpSecret(e.to_string()))
}

/// HOTP value for a decoded key and counter.
fn hotp(key: &[u8], counter: u64) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    format!("{:0width$}", binary % 10u32.pow(CODE_DIGITS), width = CODE_DIGITS as usize)
}

#[derive(Debug, Clone, Copy)]
pub struct OtpGenerator {
    interval: Duration,
    wait_threshold: Duration,
}

impl Default for OtpGenerator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(3))
    }
}

impl OtpGenerator {
    pub fn new(interval: Duration, wait_threshold: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_secs(1)),
            wait_threshold,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.otp_interval(), config.otp_wait_threshold())
    }

    fn interval_ms(&self) -> i64 {
        self.interval.as_millis() as i64
    }

    /// Interval index for a point in time.
    pub fn counter(&self, at: DateTime<Utc>) -> u64 {
        at.timestamp_millis().div_euclid(self.interval_ms()).max(0) as u64
    }

    /// Time left until the next interval boundary.
    pub fn remaining(&self, at: DateTime<Utc>) -> Duration {
        let elapsed = at.timestamp_millis().rem_euclid(self.interval_ms());
        Duration::from_millis((self.interval_ms() - elapsed) as u64)
    }

    /// Code for `secret` at `at`, with no waiting. Pure in
    /// `(secret, floor(at / interval))`.
    pub fn code_at(&self, secret: &str, at: DateTime<Utc>) -> Result<String> {
        let key = decode_secret(secret)?;
        Ok(hotp(&key, self.counter(at)))
    }

    /// Code for `secret` given the current time `now`. When the interval is
    /// about to roll over, waits until just past the boundary so the server
    /// does not receive a code that expires mid-validation.
    pub async fn generate(&self, secret: &str, now: DateTime<Utc>) -> Result<String> {
        let key = decode_secret(secret)?;

        let remaining = self.remaining(now);
        let at = if remaining <= self.wait_threshold {
            let wait = remaining + BOUNDARY_MARGIN;
            debug!(wait_ms = wait.as_millis() as u64, "OTP interval about to roll over, waiting");
            tokio::time::sleep(wait).await;
            now + chrono::Duration::milliseconds(wait.as_millis() as i64)
        } else {
            now
        };

        Ok(hotp(&key, self.counter(at)))
    }
}
