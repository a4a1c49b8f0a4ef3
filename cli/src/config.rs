//! Layered configuration (spec.md §4.9's auth/rate-limit knobs plus the
//! server's own bind address and session limits): `config.toml` under the
//! orchestrator home directory, overridden by `-c key=value` CLI flags,
//! overridden again by strongly-typed CLI flags — the same three-layer
//! precedence `codex-core::config::Config::load_with_cli_overrides` uses
//! (`config.toml` < `-c` overrides < typed overrides), scaled down to this
//! server's much smaller knob set.

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

const CONFIG_TOML_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the orchestrator home directory")]
    NoHomeDir,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub max_requests: u32,
    #[serde(default)]
    pub skip_paths: Vec<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 120,
            skip_paths: vec!["/health".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    pub hmac_secret: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

/// The config.toml shape this server reads, deserialized with `serde`
/// before being merged into a fully-resolved `ServerConfig`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    pub jwt: Option<JwtSettings>,
    pub rate_limit: Option<RateLimitSettings>,
    pub max_sessions: Option<usize>,
    pub store_path: Option<String>,
    pub pipe_dir: Option<String>,
    #[serde(default)]
    pub agent_command: Vec<String>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub supports_thinking: bool,
}

/// Fully resolved, ready-to-run configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub api_keys: Vec<String>,
    pub jwt: Option<JwtSettings>,
    pub rate_limit: RateLimitSettings,
    pub max_sessions: usize,
    pub store_path: PathBuf,
    pub pipe_dir: PathBuf,
    pub agent_command: Vec<String>,
    pub models: Vec<ModelEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 8787))
            }),
            api_keys: Vec::new(),
            jwt: None,
            rate_limit: RateLimitSettings::default(),
            max_sessions: 256,
            store_path: PathBuf::from("sessions.json"),
            pipe_dir: PathBuf::from("pipes"),
            agent_command: vec!["claude-agent".to_string()],
            models: Vec::new(),
        }
    }
}

/// CLI-flag overrides layered on top of `config.toml`; only `Some` fields
/// are applied, matching `codex-core::config::ConfigOverrides`'s shape.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_addr: Option<SocketAddr>,
    pub max_sessions: Option<usize>,
    pub store_path: Option<PathBuf>,
}

/// Honors `ORCHESTRATOR_HOME` the way `codex-core::config::find_codex_home`
/// honors `CODEX_HOME`; defaults to `~/.orchestrator`.
pub fn find_orchestrator_home() -> Result<PathBuf> {
    if let Ok(val) = std::env::var("ORCHESTRATOR_HOME")
        && !val.is_empty()
    {
        return Ok(PathBuf::from(val));
    }
    let mut home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    home.push(".orchestrator");
    Ok(home)
}

/// Reads `<home>/config.toml`, returning defaults if it does not exist.
pub fn load_config_toml(home: &Path) -> Result<ConfigToml> {
    load_config_toml_with_overrides(home, &[])
}

/// As `load_config_toml`, but applies dotted-path `-c` overrides (spec.md's
/// CLI override flag) before the typed deserialize — the same two-pass
/// parse `codex-core::config::load_config_as_toml_with_cli_overrides` uses.
pub fn load_config_toml_with_overrides(home: &Path, cli_overrides: &[(String, toml::Value)]) -> Result<ConfigToml> {
    let path = home.join(CONFIG_TOML_FILE);
    let root = match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str::<toml::Value>(&contents).map_err(|source| ConfigError::Toml { path: path.clone(), source })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Value::Table(toml::map::Map::new()),
        Err(e) => return Err(e.into()),
    };
    let root = apply_cli_overrides(root, cli_overrides);
    root.try_into().map_err(|source| ConfigError::Toml { path, source })
}

/// Applies `key=value` dotted-path overrides (spec.md's `-c` flag) onto a
/// parsed `toml::Value` before the final typed deserialize, exactly the
/// two-pass parse `codex-core::config::apply_toml_override` uses.
pub fn apply_cli_overrides(mut root: toml::Value, overrides: &[(String, toml::Value)]) -> toml::Value {
    for (path, value) in overrides {
        set_path(&mut root, path, value.clone());
    }
    root
}

fn set_path(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments = path.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if !current.is_table() {
            *current = toml::Value::Table(toml::map::Map::new());
        }
        let table = match current {
            toml::Value::Table(t) => t,
            _ => unreachable!(),
        };
        if segments.peek().is_none() {
            table.insert(segment.to_string(), value);
            return;
        }
        current = table.entry(segment.to_string()).or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

pub fn resolve(home: &Path, overrides: ConfigOverrides) -> Result<ServerConfig> {
    resolve_with_cli_overrides(home, &[], overrides)
}

pub fn resolve_with_cli_overrides(
    home: &Path,
    cli_overrides: &[(String, toml::Value)],
    overrides: ConfigOverrides,
) -> Result<ServerConfig> {
    let parsed = load_config_toml_with_overrides(home, cli_overrides)?;
    let defaults = ServerConfig::default();

    let bind_addr = overrides
        .bind_addr
        .or_else(|| parsed.bind_addr.as_deref().and_then(|s| s.parse().ok()))
        .unwrap_or(defaults.bind_addr);

    let agent_command = if parsed.agent_command.is_empty() {
        defaults.agent_command
    } else {
        parsed.agent_command
    };

    Ok(ServerConfig {
        bind_addr,
        api_keys: if parsed.api_keys.is_empty() { defaults.api_keys } else { parsed.api_keys },
        jwt: parsed.jwt.or(defaults.jwt),
        rate_limit: parsed.rate_limit.unwrap_or(defaults.rate_limit),
        max_sessions: overrides.max_sessions.or(parsed.max_sessions).unwrap_or(defaults.max_sessions),
        store_path: overrides.store_path.or_else(|| parsed.store_path.map(PathBuf::from)).unwrap_or(defaults.store_path),
        pipe_dir: parsed.pipe_dir.map(PathBuf::from).unwrap_or(defaults.pipe_dir),
        agent_command,
        models: parsed.models,
    })
}

/// Maps this server's config-file model table into the wire type the
/// facade's `supportedModels` reports.
pub fn models_to_wire(models: &[ModelEntry]) -> Vec<orchestrator_protocol::ModelInfo> {
    models
        .iter()
        .map(|m| orchestrator_protocol::ModelInfo {
            id: m.id.clone(),
            display_name: m.display_name.clone(),
            supports_thinking: m.supports_thinking,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults_apply_when_config_toml_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve(dir.path(), ConfigOverrides::default()).unwrap();
        assert_eq!(config.max_sessions, 256);
        assert_eq!(config.bind_addr.port(), 8787);
    }

    #[test]
    fn config_toml_values_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
            bind_addr = "0.0.0.0:9000"
            max_sessions = 10
            api_keys = ["secret"]
            "#,
        )
        .unwrap();
        let config = resolve(dir.path(), ConfigOverrides::default()).unwrap();
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.api_keys, vec!["secret".to_string()]);
    }

    #[test]
    fn typed_overrides_win_over_config_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "max_sessions = 10\n").unwrap();
        let overrides = ConfigOverrides {
            max_sessions: Some(99),
            ..Default::default()
        };
        let config = resolve(dir.path(), overrides).unwrap();
        assert_eq!(config.max_sessions, 99);
    }

    #[test]
    fn cli_dotted_override_sets_a_nested_path() {
        let mut root = toml::Value::Table(toml::map::Map::new());
        root = apply_cli_overrides(
            root,
            &[("rate_limit.max_requests".to_string(), toml::Value::Integer(5))],
        );
        let table = root.as_table().unwrap();
        let rate_limit = table.get("rate_limit").unwrap().as_table().unwrap();
        assert_eq!(rate_limit.get("max_requests").unwrap().as_integer(), Some(5));
    }
}
