//! tenantauth - operate a tenant session from the terminal.
//!
//! Thin driver over `tenantauth-core`: every command initializes the stored
//! session, performs one operation and exits.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tenantauth_core::{
    AuthError, CredentialStore, HttpAuthBackend, LoginRequest, SessionConfig, SessionManager, SessionState,
    TenantAccess,
};

/// Directory for a daily rolling log file, in addition to stderr
const LOG_DIR_ENV: &str = "TENANTAUTH_LOG_DIR";

const USAGE: &str = "\
Usage: tenantauth <command> [options]

Commands:
  login <code> [--redirect-uri <uri>] [--state <state>]
                        Exchange an authorization code for a session
  status                Show the current session
  token                 Print a valid access token, refreshing if needed
  whoami                Re-fetch identity and permissions from the server
  check-tenant <id>     Check whether the session may access a tenant
  logout [--all-devices]
                        End the session locally and on the server
  help                  Show this message

Set RUST_LOG to control log level (default: warn).";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login {
        code: String,
        redirect_uri: Option<String>,
        state: Option<String>,
    },
    Status,
    Token,
    Whoami,
    CheckTenant(String),
    Logout {
        all_devices: bool,
    },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some((name, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };

    match name.as_str() {
        "login" => {
            let mut code = None;
            let mut redirect_uri = None;
            let mut state = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--redirect-uri" => {
                        redirect_uri = Some(iter.next().context("--redirect-uri needs a value")?.clone())
                    }
                    "--state" => state = Some(iter.next().context("--state needs a value")?.clone()),
                    flag if flag.starts_with("--") => bail!("Unknown option for login: {}", flag),
                    value if code.is_none() => code = Some(value.to_string()),
                    value => bail!("Unexpected argument: {}", value),
                }
            }
            Ok(Command::Login {
                code: code.context("login needs an authorization code")?,
                redirect_uri,
                state,
            })
        }
        "status" => Ok(Command::Status),
        "token" => Ok(Command::Token),
        "whoami" => Ok(Command::Whoami),
        "check-tenant" => {
            let tenant = rest.first().context("check-tenant needs a tenant id")?;
            Ok(Command::CheckTenant(tenant.clone()))
        }
        "logout" => match rest {
            [] => Ok(Command::Logout { all_devices: false }),
            [flag] if flag == "--all-devices" => Ok(Command::Logout { all_devices: true }),
            _ => bail!("Usage: tenantauth logout [--all-devices]"),
        },
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=tenantauth_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(io::stderr);

    match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tenantauth.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = SessionConfig::load()?;
    let backend = HttpAuthBackend::new(&config)?;
    let credentials = CredentialStore::system(&config)?;
    let session = SessionManager::new(config, Arc::new(backend), credentials);

    let state = session.initialize();
    info!(state = %state, "Session initialized");

    let result = run(&session, command).await;
    session.shutdown();
    result
}

async fn run(session: &SessionManager, command: Command) -> Result<()> {
    match command {
        Command::Login {
            code,
            redirect_uri,
            state,
        } => {
            let mut request = LoginRequest::new(code);
            if let Some(uri) = redirect_uri {
                request = request.with_redirect_uri(uri);
            }
            if let Some(state) = state {
                request = request.with_state(state);
            }
            session.login(request).await.map_err(describe)?;
            print_status(session);
        }
        Command::Status => print_status(session),
        Command::Token => match session.ensure_valid_token().await.map_err(describe)? {
            Some(token) => println!("{}", token),
            None => bail!("Not logged in"),
        },
        Command::Whoami => {
            let user = session.refresh_user().await.map_err(describe)?;
            println!("{} <{}>", user.full_name(), user.email);
            println!("Role: {}", user.role);
            if let Some(permissions) = session.permissions() {
                let list: Vec<&str> = permissions.iter().collect();
                println!("Permissions: {}", list.join(", "));
            }
        }
        Command::CheckTenant(tenant) => match session.check_tenant_access(&tenant) {
            TenantAccess::Granted => println!("Access to tenant {} granted", tenant),
            TenantAccess::Unauthenticated => bail!("Not logged in"),
            TenantAccess::Mismatch { required, active } => {
                bail!("Session belongs to tenant {}, not {}", active, required)
            }
        },
        Command::Logout { all_devices } => {
            if session.state() == SessionState::LoggedOut {
                println!("Not logged in");
            } else {
                session.logout(all_devices).await;
                println!("Logged out");
            }
        }
        Command::Help => println!("{}", USAGE),
    }
    Ok(())
}

fn print_status(session: &SessionManager) {
    let (Some(user), Some(tenant)) = (session.current_user(), session.get_tenant_context()) else {
        println!("Not logged in");
        return;
    };

    println!("Logged in as {} <{}>", user.full_name(), user.email);
    println!("Tenant: {} ({})", tenant.name, tenant.id);
    if let Some(plan) = tenant.subscription_plan {
        println!("Plan: {}", plan);
    }
    if let Some(remaining) = session.time_until_expiry() {
        let expires = Local::now() + remaining;
        println!(
            "Token expires: {} ({} min)",
            expires.format("%Y-%m-%d %H:%M"),
            remaining.num_minutes().max(0)
        );
    }
}

/// Attach a hint for errors that need the user to sign in again.
fn describe(err: AuthError) -> anyhow::Error {
    match err {
        AuthError::ReplayedCode => anyhow::anyhow!("{} (request a new code)", err),
        e if e.is_terminal() => anyhow::anyhow!("{} (run `tenantauth login` again)", e),
        e => e.into(),
    }
}
