//! Transport module for the remote service.
//!
//! This module provides:
//! - `Transport`: throttled, retrying HTTP calls against one fixed host
//! - `Session`: cookie jar, header overrides, proxies and the session token slot
//! - Challenge detection with a pluggable `ChallengeSolver`

pub mod challenge;
pub mod client;
pub mod request;
pub mod session;

pub use challenge::{ChallengeDetector, ChallengeParams, ChallengeSolver};
pub use client::Transport;
pub use request::{Body, Call, Response};
pub use session::{CookieJar, Session, SessionToken};
