//! AgroData CLI - a command-line client for the AgroData API.
//!
//! Keeps a persistent session between invocations: `login` stores the
//! issued credentials, every other command reuses (and refreshes) them.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agrodata_core::auth::{FileStore, KeyValueStore, KeyringStore, Registration};
use agrodata_core::config::TokenBackend;
use agrodata_core::{
    ApiConfig, Config, HttpGateway, Navigator, SessionClient, SessionManager, TokenStore, UserApi,
};

// ============================================================================
// Constants
// ============================================================================

/// Log level used when neither RUST_LOG nor AGRODATA_LOG_LEVEL is set
const DEFAULT_LOG_LEVEL: &str = "warn";

const ENV_LOG_LEVEL: &str = "AGRODATA_LOG_LEVEL";
const ENV_LOG_DIR: &str = "AGRODATA_LOG_DIR";
const LOG_FILE_PREFIX: &str = "agrodata.log";

#[derive(Debug, Parser)]
#[command(name = "agrodata", version, about = "AgroData API client with persistent sessions")]
struct Cli {
    /// API base URL, e.g. http://localhost:5142/api
    #[arg(long, global = true, env = "AGRODATA_API_BASE_URL")]
    base_url: Option<String>,

    /// Where credentials are kept (remembered for later runs)
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    File,
    Keyring,
}

impl From<BackendArg> for TokenBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::File => TokenBackend::File,
            BackendArg::Keyring => TokenBackend::Keyring,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// End the session (local credentials are always removed)
    Logout,
    /// Show the current session
    Whoami,
    /// Exchange the refresh token for a new access token
    Refresh,
    /// Create an account (does not sign in)
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Request a password reset email
    ForgotPassword {
        #[arg(long)]
        email: String,
    },
    /// Set a new password with a reset token
    ResetPassword {
        #[arg(long)]
        token: String,
    },
    /// Show the signed-in user's profile
    Profile,
    /// Change the signed-in user's password
    ChangePassword,
    /// GET a protected endpoint
    Get {
        endpoint: String,
        /// Query parameter as key=value (repeatable)
        #[arg(long = "query", short = 'q', value_parser = parse_key_val)]
        query: Vec<(String, String)>,
    },
    /// POST a JSON body to a protected endpoint
    Post {
        endpoint: String,
        #[arg(long, short = 'd', default_value = "{}")]
        data: String,
    },
    /// PUT a JSON body to a protected endpoint
    Put {
        endpoint: String,
        #[arg(long, short = 'd', default_value = "{}")]
        data: String,
    },
    /// PATCH a protected endpoint with a JSON body
    Patch {
        endpoint: String,
        #[arg(long, short = 'd', default_value = "{}")]
        data: String,
    },
    /// DELETE a protected endpoint
    Delete { endpoint: String },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", s))?;
    Ok((key.to_string(), value.to_string()))
}

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG wins over AGRODATA_LOG_LEVEL. With AGRODATA_LOG_DIR set, logs go
/// to a daily-rotated file there instead of stderr; the returned guard must
/// live until exit so buffered lines are flushed.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(ENV_LOG_LEVEL))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    match std::env::var_os(ENV_LOG_DIR) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();
    info!("AgroData CLI starting");

    let cli = Cli::parse();
    let result = run(cli).await;

    info!("AgroData CLI exiting");
    result
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });
    if let Some(backend) = cli.backend {
        config.token_backend = backend.into();
    }

    let mut api_config = ApiConfig::from_env();
    if let Some(ref base_url) = cli.base_url {
        api_config = api_config.with_base_url(base_url);
    }

    let store = open_store(&config)?;
    let gateway = HttpGateway::new(api_config.clone(), store)?;
    let manager = SessionManager::new(gateway);

    match cli.command {
        Command::Login { email } => {
            let email = match email.or_else(|| config.last_email.clone()) {
                Some(email) => email,
                None => prompt("Email: ")?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            let session = manager.login(&email, &password).await?;
            config.last_email = Some(email.trim().to_string());
            print_json(&session.user.unwrap_or(Value::Null))?;
        }
        Command::Logout => {
            manager.logout().await?;
            eprintln!("Logged out.");
        }
        Command::Whoami => {
            let client = SessionClient::mount(
                manager,
                login_navigator(),
                api_config.revalidate_interval,
            );
            let snapshot = client.ready().await;
            print_json(&serde_json::to_value(&snapshot)?)?;
        }
        Command::Refresh => {
            let session = manager.refresh_token().await?;
            match session.expires_at {
                Some(at) => eprintln!("Token refreshed, expires {}.", at.to_rfc3339()),
                None => eprintln!("Token refreshed."),
            }
        }
        Command::Register { name, email } => {
            let password = rpassword::prompt_password("Password: ")?;
            let confirm = rpassword::prompt_password("Confirm password: ")?;
            let registration = Registration::new(&name, &email, &password, &confirm)?;
            let response = manager.register(&registration).await?;
            eprintln!(
                "{}",
                response.message.as_deref().unwrap_or("Account created.")
            );
            eprintln!("Run `agrodata login` to sign in.");
        }
        Command::ForgotPassword { email } => {
            let response = manager.forgot_password(&email).await?;
            print_json(&response)?;
        }
        Command::ResetPassword { token } => {
            let password = rpassword::prompt_password("New password: ")?;
            let response = manager.reset_password(&token, &password).await?;
            print_json(&response)?;
        }
        Command::Profile => {
            let user_api = UserApi::new(manager.protected_gateway());
            print_json(&user_api.profile().await?)?;
        }
        Command::ChangePassword => {
            let current = rpassword::prompt_password("Current password: ")?;
            let new = rpassword::prompt_password("New password: ")?;
            let user_api = UserApi::new(manager.protected_gateway());
            print_json(&user_api.change_password(&current, &new).await?)?;
        }
        Command::Get { endpoint, query } => {
            let params: Vec<(&str, &str)> = query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let body: Value = manager.protected_gateway().get(&endpoint, &params).await?;
            print_json(&body)?;
        }
        Command::Post { endpoint, data } => {
            let payload = parse_json(&data)?;
            let body: Value = manager.protected_gateway().post(&endpoint, &payload).await?;
            print_json(&body)?;
        }
        Command::Put { endpoint, data } => {
            let payload = parse_json(&data)?;
            let body: Value = manager.protected_gateway().put(&endpoint, &payload).await?;
            print_json(&body)?;
        }
        Command::Patch { endpoint, data } => {
            let payload = parse_json(&data)?;
            let body: Value = manager.protected_gateway().patch(&endpoint, &payload).await?;
            print_json(&body)?;
        }
        Command::Delete { endpoint } => {
            let body: Value = manager.protected_gateway().delete(&endpoint).await?;
            print_json(&body)?;
        }
    }

    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<TokenStore> {
    let backend: Arc<dyn KeyValueStore> = match config.token_backend {
        TokenBackend::File => Arc::new(FileStore::open(&config.data_dir()?)?),
        TokenBackend::Keyring => Arc::new(KeyringStore::new()),
    };
    Ok(TokenStore::new(backend))
}

fn login_navigator() -> Arc<dyn Navigator> {
    Arc::new(|| eprintln!("Session expired. Run `agrodata login` to sign in again."))
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("No input given");
    }
    Ok(line)
}

fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).context("--data is not valid JSON")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
