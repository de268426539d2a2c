//! Terminal client for the Konbini auth API.
//!
//! Thin front-end over `konbini-session`: each subcommand maps to one
//! session-manager operation, and session state is read the way a UI would,
//! through the snapshot watch, never by poking at internals. The token
//! persists under `~/.konbini/token` between invocations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use konbini_session::{
    ApiClient, ApiConfig, LoginRequest, RegisterRequest, SessionError, SessionManager,
    SessionSnapshot, TokenStore,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Api(#[from] konbini_session::ApiError),
    #[error("output serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "konbini", about = "Konbini session and step-up CLI")]
struct Cli {
    #[arg(long, env = "KONBINI_BASE_URL", default_value = "http://127.0.0.1:8080")]
    base_url: String,

    /// Where the session token is persisted. Defaults to `~/.konbini/token`.
    #[arg(long, env = "KONBINI_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Overall per-request deadline in seconds. Unset leaves it to the
    /// transport.
    #[arg(long, env = "KONBINI_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account and start a session.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        nickname: String,
    },
    /// Sign in with primary credentials.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Six-digit TOTP code, for accounts with step-up enabled.
        #[arg(long)]
        totp_code: Option<String>,
    },
    /// Revalidate the stored session and print the snapshot.
    Status,
    /// Step-up (TOTP) management.
    Totp(TotpCommand),
    /// Re-send the address-verification mail.
    ResendVerification,
    /// End the session. Works offline; the server is notified best-effort.
    Logout,
}

#[derive(Args, Debug)]
struct TotpCommand {
    #[command(subcommand)]
    command: TotpSubcommand,
}

#[derive(Subcommand, Debug)]
enum TotpSubcommand {
    /// Begin enrollment; prints the otpauth:// provisioning URI.
    Setup,
    /// Verify a code; prints the one-time recovery codes.
    Lock {
        #[arg(long)]
        code: String,
    },
    /// Disable TOTP on the account.
    Remove {
        #[arg(long)]
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = ApiConfig::new(cli.base_url);
    if let Some(secs) = cli.request_timeout_secs {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }

    let api = Arc::new(ApiClient::new(config)?);
    let manager = SessionManager::new(api, token_store(cli.token_file));

    run(&manager, cli.command).await
}

async fn run(manager: &SessionManager, command: Command) -> Result<(), CliError> {
    match command {
        Command::Register { email, password, nickname } => {
            let req = RegisterRequest { email, password, nickname };
            manager.register(req).await.map_err(report_field_errors)?;
            eprintln!("registered; a verification email is on its way");
            print_snapshot(&manager.snapshot())
        }
        Command::Login { email, password, totp_code } => {
            let req = LoginRequest { email, password, totp_code };
            manager.login(req).await.map_err(report_field_errors)?;
            let snap = manager.snapshot();
            if snap.is_partial_auth() {
                eprintln!("step-up required: run `konbini totp lock --code <code>`");
            }
            print_snapshot(&snap)
        }
        Command::Status => {
            // Read through the watch, the way a route guard consumes state.
            let mut watch = manager.subscribe();
            manager.check_session().await?;
            let snap = watch.borrow_and_update().clone();
            print_snapshot(&snap)
        }
        Command::Totp(totp) => run_totp(manager, totp).await,
        Command::ResendVerification => {
            manager.resend_verification_email().await?;
            eprintln!("verification email re-sent");
            Ok(())
        }
        Command::Logout => {
            manager.logout();
            // Give the fire-and-forget server notification a moment to leave
            // before the runtime shuts down.
            tokio::time::sleep(Duration::from_millis(250)).await;
            eprintln!("logged out");
            Ok(())
        }
    }
}

async fn run_totp(manager: &SessionManager, totp: TotpCommand) -> Result<(), CliError> {
    // TOTP commands act on the persisted session from a previous login.
    manager.check_session().await?;

    match totp.command {
        TotpSubcommand::Setup => {
            let url = manager.totp_setup().await?;
            println!("{url}");
            eprintln!("scan the URI, then run `konbini totp lock --code <code>`");
            Ok(())
        }
        TotpSubcommand::Lock { code } => {
            let codes = manager.totp_lock(&code).await.map_err(report_field_errors)?;
            eprintln!("recovery codes (shown once, store them safely):");
            for recovery_code in codes {
                println!("{recovery_code}");
            }
            print_snapshot(&manager.snapshot())
        }
        TotpSubcommand::Remove { code } => {
            manager.totp_remove(&code).await.map_err(report_field_errors)?;
            eprintln!("TOTP disabled");
            print_snapshot(&manager.snapshot())
        }
    }
}

/// Surface field-level validation messages before the error propagates.
fn report_field_errors(err: SessionError) -> SessionError {
    if let SessionError::Api(api) = &err {
        if let Some(fields) = api.fields() {
            for (field, message) in fields {
                eprintln!("{field}: {message}");
            }
        }
    }
    err
}

fn print_snapshot(snap: &SessionSnapshot) -> Result<(), CliError> {
    eprintln!("state: {}", state_label(snap));
    println!("{}", serde_json::to_string_pretty(snap)?);
    Ok(())
}

fn state_label(snap: &SessionSnapshot) -> &'static str {
    if snap.is_authenticated() {
        "authenticated"
    } else if snap.is_partial_auth() {
        "partially-authenticated"
    } else {
        "unauthenticated"
    }
}

fn token_store(path: Option<PathBuf>) -> TokenStore {
    match path.or_else(default_token_path) {
        Some(path) => TokenStore::open(path),
        None => {
            tracing::warn!("no usable token path; session will not persist");
            TokenStore::in_memory()
        }
    }
}

fn default_token_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".konbini").join("token"))
}
