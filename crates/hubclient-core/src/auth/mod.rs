//! Authentication module for logging in and managing credentials.
//!
//! This module provides:
//! - `Authenticator`: the cookie → password → OTP login state machine
//! - `OtpGenerator`: time-based one-time password derivation
//! - `CredentialStore`: persistence for passwords, cookie jars and OTP seeds,
//!   backed by memory, the OS keychain or an encrypted vault file

pub mod credentials;
pub mod machine;
pub mod otp;
pub mod vault;

pub use credentials::{CredentialStore, Credentials, KeyringCredentialStore, MemoryCredentialStore};
pub use machine::{AuthResult, AuthState, Authenticator, LoginOptions, OtpContinuation};
pub use otp::OtpGenerator;
pub use vault::VaultCredentialStore;
