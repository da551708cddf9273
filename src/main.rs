//! CLI for svclink
//!
//! Subcommands:
//! - `broker`: serve an in-process broker over WebSockets
//! - `settings-server`: answer `getSetting` from a static settings file
//! - `call`: make one direct RPC call and print the response

use std::path::PathBuf;

use clap::Parser;
use serde_json::Value;
use svclink::broker::{Credentials, MemoryBroker};
use svclink::config::keys;
use svclink::config::service::settings_router;
use svclink::config::settings::DEFAULT_SETTINGS_SERVICE_NAME;
use svclink::rpc::DirectCaller;
use svclink::transport::start_websocket_server;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "svclink")]
enum Command {
    /// Serve an in-process topic broker over WebSockets
    Broker {
        #[arg(long, default_value = "127.0.0.1:5680")]
        bind: String,
        /// Require this username (together with --password)
        #[arg(long, requires = "password")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
    },
    /// Serve `getSetting` from a settings file
    SettingsServer {
        #[arg(long)]
        file: PathBuf,
        /// Module name the handler is mounted under
        #[arg(long, default_value = DEFAULT_SETTINGS_SERVICE_NAME)]
        name: String,
        #[arg(long, default_value = "127.0.0.1:8090")]
        bind: String,
    },
    /// Make one direct RPC call and print the response envelope
    Call {
        /// host:port of the service
        #[arg(long)]
        base: String,
        #[arg(long)]
        module: String,
        #[arg(long)]
        action: String,
        /// JSON params
        #[arg(long, default_value = "null")]
        params: String,
        #[arg(long, default_value = "svclink-cli")]
        from: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let level = std::env::var(keys::LOG_LEVEL).unwrap_or_else(|_| "info".to_string());
    svclink::utils::logging::init(&level);

    let result = match Command::parse() {
        Command::Broker {
            bind,
            username,
            password,
        } => run_broker(&bind, username.zip(password)).await,
        Command::SettingsServer { file, name, bind } => {
            run_settings_server(&file, &name, &bind).await
        }
        Command::Call {
            base,
            module,
            action,
            params,
            from,
        } => run_call(&base, &module, &action, &params, &from).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_broker(
    bind: &str,
    credentials: Option<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut broker = MemoryBroker::new();
    if let Some((username, password)) = credentials {
        broker = broker.with_credentials(Credentials::new(username, password));
    }

    tokio::select! {
        result = start_websocket_server(bind, broker) => {
            result?;
            error!("Broker server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    Ok(())
}

async fn run_settings_server(
    file: &std::path::Path,
    name: &str,
    bind: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = settings_router(name, file)?;
    let listener = TcpListener::bind(bind).await?;
    info!("settings service listening on http://{}", listener.local_addr()?);

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result?;
            error!("Settings server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    Ok(())
}

async fn run_call(
    base: &str,
    module: &str,
    action: &str,
    params: &str,
    from: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let params: Value = serde_json::from_str(params)?;
    let caller = DirectCaller::new(from);
    let response = caller.call_at(base, module, action, params).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
