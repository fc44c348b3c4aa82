//! mealplan - command line client for the mealplan service.
//!
//! Signs in, shows the stored session, and sends authenticated requests
//! through the same session handling the apps use.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mealplan_core::api::Method;
use mealplan_core::models::RegisterRequest;
use mealplan_core::{ApiClient, Config, CredentialStore, StorageOptions};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file prefix inside `<data_dir>/logs`
const LOG_FILE_PREFIX: &str = "mealplan.log";

#[derive(Debug, Parser)]
#[command(name = "mealplan", version, about = "Command line client for the mealplan service")]
struct Cli {
    /// Override the backend base URL (takes precedence over MEALPLAN_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account and store the session
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the stored session
    Status,
    /// Send a request to the backend (or any URL) and print the response
    Request {
        /// HTTP method, e.g. GET or POST
        method: String,
        /// Path relative to the base URL, or an absolute URL
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
}

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
/// The returned guard flushes the log file on drop.
fn init_tracing(data_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    match data_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let data_dir = config.data_dir().ok();
    let _log_guard = init_tracing(data_dir.as_deref());
    info!(base_url = %config.base_url, "mealplan starting");

    let credentials = Arc::new(CredentialStore::open(StorageOptions::from_config(&config)?).await?);
    let api = ApiClient::from_config(&config, credentials)?;

    match cli.command {
        Command::Login { email } => login(&api, email).await,
        Command::Register {
            email,
            first_name,
            last_name,
        } => register(&api, email, first_name, last_name).await,
        Command::Logout => {
            api.logout()?;
            println!("Logged out.");
            Ok(())
        }
        Command::Status => {
            status(&api);
            Ok(())
        }
        Command::Request { method, path, body } => request(&api, &method, &path, body).await,
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;

    let mut value = String::new();
    io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

async fn login(api: &ApiClient, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt("Email")?,
    };
    let password = prompt_password()?;

    println!("Authenticating...");
    let session = api.login(&email, &password).await.context("Login failed")?;
    println!(
        "Login successful. Session valid for {} minutes.",
        session.minutes_until_expiry()
    );
    Ok(())
}

async fn register(api: &ApiClient, email: String, first_name: String, last_name: String) -> Result<()> {
    let password = prompt_password()?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }

    let request = RegisterRequest {
        email,
        password,
        first_name,
        last_name,
    };
    api.register(&request).await.context("Registration failed")?;
    println!("Account created and signed in.");
    Ok(())
}

fn status(api: &ApiClient) {
    let credentials = api.credentials();
    println!("Backend:  {}", api.base_url());
    println!("Storage:  {}", credentials.mode());

    match credentials.session() {
        Some(session) => {
            println!("User:     {}", session.user_id.as_deref().unwrap_or("unknown"));
            println!("Expires:  {}", session.expires_at.to_rfc3339());
            if session.is_expired() {
                println!("Status:   access token expired (will refresh on next request)");
            } else {
                println!(
                    "Status:   signed in ({} minutes left)",
                    session.minutes_until_expiry()
                );
            }
        }
        None => println!("Status:   signed out"),
    }
}

async fn request(api: &ApiClient, method: &str, path: &str, body: Option<String>) -> Result<()> {
    let method = parse_method(method)?;
    let body = body
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
        .transpose()
        .context("Request body is not valid JSON")?;

    let response = match api.execute(method, path, body.as_ref()).await {
        Ok(response) => response,
        Err(e) if e.is_session_terminated() => {
            eprintln!("Signed out. Run `mealplan login` to sign in again.");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    eprintln!("{status}");
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{text}"),
    }
    Ok(())
}

fn parse_method(method: &str) -> Result<Method> {
    method
        .to_uppercase()
        .parse()
        .with_context(|| format!("Unsupported HTTP method: {method}"))
}
