//! hubclient core - a resilient authenticated session engine.
//!
//! This crate provides the building blocks used by the `hubclient` binary:
//! a throttled, retrying transport with challenge dispatch, the
//! cookie → password → OTP login state machine, credential stores, and a
//! concurrent harvest pipeline that hands aggregated batches to a storage
//! sink.

pub mod account;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod harvest;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use account::{Account, AccountKind, Capabilities, Collection};
pub use auth::{
    AuthState, CredentialStore, Credentials, KeyringCredentialStore, LoginOptions, MemoryCredentialStore,
    OtpGenerator, VaultCredentialStore,
};
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use error::{Error, Result};
pub use extract::{PageExtractor, RegexExtractor};
pub use harvest::{HarvestBatch, HarvestPipeline, HarvestReport, HarvestResult, HarvestTask, JsonFileSink, StorageSink};
pub use transport::{Call, ChallengeParams, ChallengeSolver, CookieJar, Response, SessionToken, Transport};
