//! Shared fixtures for unit tests.

use std::collections::BTreeMap;

use crate::config::Config;

pub(crate) const CHALLENGE_PAGE: &str = r#"<html><head><script>
function leastFactor(n) { return 2; }
function go() {
    var p=1234567; var s=89; var n;
    n=leastFactor(p);
}
document.cookie="KEY="+n+"*"+p/n+":"+s+":1:1";
document.location.reload(true);
</script></head></html>"#;

/// RFC 6238 reference secret ("12345678901234567890") in base32.
pub(crate) const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

/// Fast-failing configuration pointed at a mock server.
pub(crate) fn test_config(host: &str) -> Config {
    Config {
        host: host.to_string(),
        max_attempts: 3,
        backoff_ms: 0,
        delay_ms: 0,
        otp_wait_threshold_secs: 0,
        bootstrap_cookies: BTreeMap::new(),
        ..Config::default()
    }
}
