//! hubclient - command-line front end for the hubclient session engine.
//!
//! Logs in (reusing cached cookies when possible), registers credentials,
//! and harvests JSON endpoints into the configured storage sink.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hubclient_core::{
    Client, Config, CredentialStore, Credentials, KeyringCredentialStore, LoginOptions,
    VaultCredentialStore,
};

// ============================================================================
// Constants
// ============================================================================

const USERNAME_ENV: &str = "HUBCLIENT_USERNAME";
const PASSWORD_ENV: &str = "HUBCLIENT_PASSWORD";
const VAULT_PASSPHRASE_ENV: &str = "HUBCLIENT_VAULT_PASSPHRASE";
const LOG_DIR_ENV: &str = "HUBCLIENT_LOG_DIR";

const VAULT_FILE: &str = "vault.json";

const USAGE: &str = "\
Usage: hubclient <command> [args]

Commands:
  login [--force]                     Log in, reusing cached cookies when valid
  register <username>                 Store a password and optional OTP seed
  harvest <category> <endpoint>...    Fetch endpoints concurrently and store the results
  logout                              Drop the session and forget cached cookies

Environment:
  HUBCLIENT_USERNAME, HUBCLIENT_PASSWORD, HUBCLIENT_VAULT_PASSPHRASE, HUBCLIENT_LOG_DIR, RUST_LOG";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // RUST_LOG controls the level (e.g., RUST_LOG=hubclient_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_layer = std::env::var_os(LOG_DIR_ENV).and_then(|dir| {
        match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("hubclient")
            .filename_suffix("log")
            .build(&dir)
        {
            Ok(appender) => Some(fmt::layer().with_writer(appender).with_ansi(false)),
            Err(e) => {
                eprintln!("Warning: Failed to open log directory {:?}: {}", dir, e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load()?;

    match command.as_str() {
        "login" => login(&mut config, args.iter().any(|a| a == "--force")).await,
        "register" => {
            let username = args.get(1).context("register needs a username")?;
            register(&config, username)
        }
        "harvest" => {
            let category = args.get(1).context("harvest needs a category")?;
            let endpoints = &args[2..];
            if endpoints.is_empty() {
                bail!("harvest needs at least one endpoint");
            }
            harvest(&mut config, category, endpoints).await
        }
        "logout" => logout(&config).await,
        "help" | "-h" | "--help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// The encrypted vault when a passphrase is set, the OS keychain otherwise.
fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    match std::env::var(VAULT_PASSPHRASE_ENV) {
        Ok(passphrase) => {
            let path = config.data_dir()?.join(VAULT_FILE);
            info!(path = %path.display(), "Using encrypted credential vault");
            Ok(Arc::new(VaultCredentialStore::open(path, &passphrase)?))
        }
        Err(_) => Ok(Arc::new(KeyringCredentialStore)),
    }
}

fn resolve_username(config: &Config) -> Result<String> {
    std::env::var(USERNAME_ENV)
        .ok()
        .filter(|u| !u.is_empty())
        .or_else(|| config.last_username.clone())
        .with_context(|| format!("No username: set {} or log in once", USERNAME_ENV))
}

fn build_client(config: &Config, username: &str, store: Arc<dyn CredentialStore>) -> Result<Client> {
    let mut credentials = Credentials::new(username);
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        credentials = credentials.with_password(password);
    }

    Ok(Client::builder(credentials)
        .config(config.clone())
        .store(store)
        .build()?)
}

fn remember_username(config: &mut Config, username: &str) {
    if config.last_username.as_deref() == Some(username) {
        return;
    }
    config.last_username = Some(username.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn login(config: &mut Config, force: bool) -> Result<()> {
    let username = resolve_username(config)?;
    let client = build_client(config, &username, open_store(config)?)?;

    let options = if force { LoginOptions::force() } else { LoginOptions::default() };
    client.login(options).await?;
    remember_username(config, &username);

    let account = client.account()?;
    println!(
        "Logged in as {}{}",
        account.name,
        if account.is_premium { " (premium)" } else { "" }
    );
    Ok(())
}

fn register(config: &Config, username: &str) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    let seed = rpassword::prompt_password("OTP seed (leave empty for none): ")?;
    let seed = seed.trim();

    let client = build_client(config, username, open_store(config)?)?;
    client.register_credentials(username, &password, (!seed.is_empty()).then_some(seed))?;

    println!("Credentials saved for {}", username);
    Ok(())
}

async fn harvest(config: &mut Config, category: &str, endpoints: &[String]) -> Result<()> {
    let username = resolve_username(config)?;
    let client = build_client(config, &username, open_store(config)?)?;

    // Public endpoints still harvest without a session
    if client.login(LoginOptions::default().tolerant()).await? {
        remember_username(config, &username);
    } else {
        warn!(user = %username, "Harvesting without a session");
    }

    let report = client.harvest(category, endpoints.iter().cloned()).await;

    let failures: Vec<_> = report
        .failed()
        .map(|r| {
            json!({
                "id": r.id,
                "error": r.outcome.as_ref().err().map(|e| e.to_string()),
            })
        })
        .collect();
    let summary = json!({
        "category": report.category,
        "succeeded": report.succeeded().count(),
        "failed": failures,
        "stored": report.stored.as_ref().ok(),
        "storage_error": report.stored.as_ref().err().map(|e| e.to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Err(e) = report.stored {
        bail!("Harvest could not be stored: {}", e);
    }
    Ok(())
}

async fn logout(config: &Config) -> Result<()> {
    let username = resolve_username(config)?;
    let store = open_store(config)?;
    let client = build_client(config, &username, Arc::clone(&store))?;

    client.logout().await;
    store
        .delete_cookies(&username)
        .context("Failed to delete cached cookies")?;

    println!("Logged out {}", username);
    Ok(())
}
