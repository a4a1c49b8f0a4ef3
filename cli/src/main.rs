//! Binary entry point: parse CLI flags, load config, wire a `LocalSandbox`
//! through a `SessionRegistry`, and serve `orchestrator-rpc`'s router.
//! Tracing init mirrors `codex-mcp-server::run_main`'s
//! `tracing_subscriber::fmt().with_writer(std::io::stderr)`, generalized to
//! read `RUST_LOG` via `EnvFilter` the way the rest of the teacher
//! workspace's binaries do.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use orchestrator_cli::command::build_command_builder;
use orchestrator_cli::config;
use orchestrator_core::event_bus::EventBus;
use orchestrator_core::registry::SessionRegistry;
use orchestrator_core::sandbox::LocalSandbox;
use orchestrator_core::store::JsonFileStore;
use orchestrator_rpc::auth::AuthConfig;
use orchestrator_rpc::auth::JwtConfig;
use orchestrator_rpc::rate_limit::ClientRateLimiter;
use orchestrator_rpc::server::router;
use orchestrator_rpc::server::ServerState;
use orchestrator_rpc::Facade;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Stateful session orchestrator")]
struct Cli {
    /// Address to bind the RPC server to, e.g. 127.0.0.1:8787.
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Maximum number of concurrently tracked sessions.
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Override the session store's file path.
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Set a config.toml value by dotted path, e.g. `-c rate_limit.max_requests=10`.
    #[arg(short = 'c', value_parser = parse_override)]
    config_override: Vec<(String, toml::Value)>,
}

/// Parses `key=value`, guessing the value's TOML type the way
/// `codex-core::config`'s `-c` flag does: integers and bools parse as
/// themselves, everything else is a string.
fn parse_override(raw: &str) -> Result<(String, toml::Value), String> {
    let (path, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let parsed = if let Ok(n) = value.parse::<i64>() {
        toml::Value::Integer(n)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else if let Ok(b) = value.parse::<bool>() {
        toml::Value::Boolean(b)
    } else {
        toml::Value::String(value.to_string())
    };
    Ok((path.to_string(), parsed))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let home = config::find_orchestrator_home()?;
    std::fs::create_dir_all(&home)?;

    let overrides = config::ConfigOverrides {
        bind_addr: cli.bind,
        max_sessions: cli.max_sessions,
        store_path: cli.store_path,
    };
    let server_config = config::resolve_with_cli_overrides(&home, &cli.config_override, overrides)?;

    let store_path = if server_config.store_path.is_absolute() {
        server_config.store_path.clone()
    } else {
        home.join(&server_config.store_path)
    };
    let pipe_dir = if server_config.pipe_dir.is_absolute() {
        server_config.pipe_dir.clone()
    } else {
        home.join(&server_config.pipe_dir)
    };
    std::fs::create_dir_all(&pipe_dir)?;

    let store = Arc::new(JsonFileStore::open(store_path).await?);
    let bus = EventBus::new();
    let command_builder = build_command_builder(server_config.agent_command.clone());

    let registry = Arc::new(SessionRegistry::new(
        store,
        Arc::new(LocalSandbox),
        bus.clone(),
        server_config.max_sessions,
        command_builder,
        config::models_to_wire(&server_config.models),
        pipe_dir,
    ));
    registry.bind_self();

    let facade = Arc::new(Facade::new(registry, bus));
    let mut state = ServerState::new(facade);

    if !server_config.api_keys.is_empty() || server_config.jwt.is_some() {
        let jwt = server_config.jwt.as_ref().map(|j| JwtConfig {
            decoding_key: jsonwebtoken::DecodingKey::from_secret(j.hmac_secret.as_bytes()),
            algorithm: jsonwebtoken::Algorithm::HS256,
            issuer: j.issuer.clone(),
            audience: j.audience.clone(),
        });
        state = state.with_auth(Arc::new(AuthConfig::new(server_config.api_keys.clone(), jwt)));
    }

    let rate_limit = ClientRateLimiter::new(
        std::time::Duration::from_secs(server_config.rate_limit.window_secs),
        server_config.rate_limit.max_requests,
        server_config.rate_limit.skip_paths.clone(),
    );
    state = state.with_rate_limit(Arc::new(rate_limit));

    let app = router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();
    let listener = tokio::net::TcpListener::bind(server_config.bind_addr).await?;
    info!(addr = %server_config.bind_addr, "orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
