//! Anti-automation challenge detection and solver dispatch.
//!
//! The remote service occasionally answers with a script interstitial
//! instead of the requested page. The detector recognises it from the body;
//! solving is delegated to a pluggable [`ChallengeSolver`] that mutates the
//! session (typically by injecting a validation cookie) before the call is
//! replayed.

use regex::Regex;

use super::session::Session;

/// Default interstitial marker: a `go()` script that computes a value and
/// stores it in a cookie before reloading the page.
const DEFAULT_CHALLENGE_PATTERN: &str =
    r#"(?s)function\s+go\(\)\s*\{(.*?)\}.*?document\.cookie\s*=\s*["']([A-Za-z0-9_]+)=["']"#;

/// Parameters extracted from a challenge page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParams {
    /// Script body of the challenge function.
    pub script: String,
    /// Name of the cookie the challenge expects to be set.
    pub cookie_name: String,
}

/// Solves a detected challenge by mutating session state in place.
pub trait ChallengeSolver: Send + Sync {
    fn solve(&self, session: &mut Session, params: &ChallengeParams) -> anyhow::Result<()>;
}

impl<F> ChallengeSolver for F
where
    F: Fn(&mut Session, &ChallengeParams) -> anyhow::Result<()> + Send + Sync,
{
    fn solve(&self, session: &mut Session, params: &ChallengeParams) -> anyhow::Result<()> {
        self(session, params)
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    pattern: Regex,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_CHALLENGE_PATTERN).expect("default challenge pattern is valid"),
        }
    }
}

impl ChallengeDetector {
    /// Build a detector from a custom pattern. The first capture group is
    /// the script body, the second the cookie name.
    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Scan a body for the challenge marker.
    pub fn detect(&self, body: &str) -> Option<ChallengeParams> {
        let caps = self.pattern.captures(body)?;
        Some(ChallengeParams {
            script: caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            cookie_name: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
    }
}
