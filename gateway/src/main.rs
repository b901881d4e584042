use std::{path::PathBuf, sync::Arc};

use billing_gateway::{
    AccountClient, ApiResponse, FileSessionStore, Gateway, GatewayConfig, RequestOptions,
};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "billing-gateway", version, about = "Talk to the billing backend")]
struct Cli {
    /// Where the session is kept between runs
    #[arg(long, env = "SESSION_FILE", default_value = ".billing-gateway-session.json")]
    session_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and keep the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "BILLING_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Show who the stored session belongs to
    Whoami,
    Get {
        path: String,
        /// Query parameters as key=value
        #[arg(short, long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,
    },
    Post {
        path: String,
        /// JSON body
        body: Option<String>,
    },
    Put {
        path: String,
        /// JSON body
        body: Option<String>,
    },
    Delete {
        path: String,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn parse_body(raw: Option<String>) -> color_eyre::Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).wrap_err("body is not valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    setup_tracing()?;

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { run(cli).await })
}

fn setup_tracing() -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_writer(std::io::stderr)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .try_init()
        .map_err(|e| eyre!("failed to install tracing subscriber: {e}"))
}

async fn run(cli: Cli) -> color_eyre::Result<()> {
    let config = GatewayConfig::from_env()?;
    info!(base_url = %config.base_url, "using backend");

    let gateway = Gateway::builder(config)
        .session_store(Arc::new(FileSessionStore::new(&cli.session_file)))
        .build()?;
    let restored = gateway.session().restore().await;
    debug!(restored, "session loaded");

    let account = AccountClient::new(gateway.clone());

    let response = match cli.command {
        Command::Login { email, password } => {
            let session = account.login(&email, &password).await?;
            println!(
                "signed in, token valid until {}",
                session
                    .expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            return Ok(());
        }
        Command::Logout => {
            account.logout().await;
            println!("signed out");
            return Ok(());
        }
        Command::Whoami => {
            let session = gateway.session().snapshot();
            let identity = session.identity.as_ref();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "authenticated": session.is_authenticated(),
                    "subject": identity.and_then(|c| c.subject()),
                    "role": identity.and_then(|c| c.role.clone()),
                    "admin": session.is_admin(),
                    "expiresAt": session.expires_at,
                }))?
            );
            return Ok(());
        }
        Command::Get { path, query } => {
            let options = query
                .into_iter()
                .fold(RequestOptions::default(), |options, (k, v)| options.query(k, v));
            gateway.request(Method::GET, &path, None, options).await?
        }
        Command::Post { path, body } => gateway.post(&path, parse_body(body)?).await?,
        Command::Put { path, body } => gateway.put(&path, parse_body(body)?).await?,
        Command::Delete { path } => gateway.delete(&path).await?,
    };

    print_response(&response)?;
    Ok(())
}

fn print_response(response: &ApiResponse) -> color_eyre::Result<()> {
    match response.json_value() {
        Some(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        None if response.has_body() => println!("{}", response.text()),
        None => println!("{}", response.status),
    }
    Ok(())
}
