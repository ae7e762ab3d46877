//! Gateway configuration, loaded from an optional TOML file.
//!
//! Every field has a default reproducing the reference deployment: the
//! gateway listens on `127.0.0.1:18789` and launches `python3 -u main.py
//! <objective>` with output buffering disabled.

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::classifier::MarkerSet;
use crate::error::ConfigError;
use crate::spawn::LaunchSpec;

pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_CONFIG_FILE: &str = "stingbot.toml";
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub command: CommandConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub program: PathBuf,
    /// Arguments placed before the objective, which is always last.
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub kill_grace_ms: u64,
    /// Upper bound on the stdout/stderr kept for the final mission result.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["-u".to_string(), "main.py".to_string()],
            working_dir: PathBuf::from("."),
            env: HashMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ExecutorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Binds `objective` into the executor invocation.
    pub fn launch_spec(&self, objective: &str) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.program, &self.working_dir)
            .args(self.args.iter().cloned())
            .arg(objective)
            .kill_grace(self.kill_grace());
        spec.env.extend(self.env.clone());
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    /// Shell and leading arguments; the command text is appended last.
    pub shell: Vec<String>,
    pub timeout_ms: u64,
    /// Directory used when a request carries no `cwd`. Falls back to the
    /// executor working directory.
    pub default_cwd: Option<PathBuf>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            default_cwd: None,
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(windows)]
fn default_shell() -> Vec<String> {
    vec!["cmd".to_string(), "/C".to_string()]
}

#[cfg(not(windows))]
fn default_shell() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub progress_markers: Vec<String>,
    pub result_marker: String,
    /// Accept `{"kind": ..., "payload": ...}` lines ahead of marker heuristics.
    pub structured_records: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            progress_markers: vec!["[*]".to_string(), "\u{2192}".to_string()],
            result_marker: "MISSION_RESULT:".to_string(),
            structured_records: true,
        }
    }
}

impl ClassifierConfig {
    pub fn markers(&self) -> MarkerSet {
        MarkerSet::new(self.progress_markers.iter().cloned(), self.result_marker.clone())
            .with_structured_records(self.structured_records)
    }
}

/// The part of the configuration every session needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeConfig {
    pub executor: ExecutorConfig,
    pub command: CommandConfig,
    pub classifier: ClassifierConfig,
}

impl BridgeConfig {
    pub fn command_cwd(&self, requested: Option<&str>) -> PathBuf {
        match requested.map(str::trim).filter(|cwd| !cwd.is_empty()) {
            Some(cwd) => PathBuf::from(cwd),
            None => self
                .command
                .default_cwd
                .clone()
                .unwrap_or_else(|| self.executor.working_dir.clone()),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given. Without a path, `stingbot.toml` in the current
    /// directory is used if present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !candidate.is_file() {
                    return Ok(Self::default());
                }
                candidate
            }
        };
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "executor.program must not be empty".to_string(),
            ));
        }
        if self.command.shell.is_empty() {
            return Err(ConfigError::Invalid(
                "command.shell must name a program".to_string(),
            ));
        }
        if self.command.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "command.timeout_ms must be positive".to_string(),
            ));
        }
        if self.classifier.result_marker.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "classifier.result_marker must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Makes the executor working directory absolute so it stays valid no
    /// matter where commands run from.
    pub fn resolve_working_dir(&mut self) -> Result<(), ConfigError> {
        let dir = &self.executor.working_dir;
        let resolved = dir.canonicalize().map_err(|err| {
            ConfigError::Invalid(format!(
                "executor.working_dir `{}` is not resolvable: {err}",
                dir.display()
            ))
        })?;
        self.executor.working_dir = resolved;
        Ok(())
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            executor: self.executor.clone(),
            command: self.command.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.socket_addr().to_string(), "127.0.0.1:18789");
        assert_eq!(config.command.timeout(), Duration::from_secs(30));

        let spec = config.executor.launch_spec("scan localhost");
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert_eq!(
            spec.args,
            vec![
                "-u".to_string(),
                "main.py".to_string(),
                "scan localhost".to_string()
            ]
        );
        assert_eq!(
            spec.env.get("PYTHONUNBUFFERED").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [executor]
            program = "/usr/bin/python3"
            working_dir = "/opt/brain"

            [classifier]
            progress_markers = [">>"]
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.executor.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(config.executor.args, ExecutorConfig::default().args);
        assert_eq!(config.classifier.result_marker, "MISSION_RESULT:");
        assert_eq!(config.command, CommandConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = GatewayConfig::from_toml_str("[server]\nprot = 1\n");
        assert_matches!(result, Err(ConfigError::Parse(_)));
    }

    #[test]
    fn validation_rejects_empty_shell_and_zero_timeout() {
        assert_matches!(
            GatewayConfig::from_toml_str("[command]\nshell = []\n"),
            Err(ConfigError::Invalid(_))
        );
        assert_matches!(
            GatewayConfig::from_toml_str("[command]\ntimeout_ms = 0\n"),
            Err(ConfigError::Invalid(_))
        );
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[command]\ntimeout_ms = 500\n").expect("write");
        let config = GatewayConfig::load(Some(&path)).expect("load");
        assert_eq!(config.command.timeout(), Duration::from_millis(500));

        let missing = GatewayConfig::load(Some(&dir.path().join("absent.toml")));
        assert_matches!(missing, Err(ConfigError::Read { .. }));
    }

    #[test]
    fn resolve_working_dir_canonicalizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = GatewayConfig::default();
        config.executor.working_dir = dir.path().join(".");
        config.resolve_working_dir().expect("resolve");
        assert!(config.executor.working_dir.is_absolute());

        config.executor.working_dir = dir.path().join("missing");
        assert_matches!(
            config.resolve_working_dir(),
            Err(ConfigError::Invalid(_))
        );
    }

    #[test]
    fn command_cwd_prefers_request_then_default() {
        let mut bridge = GatewayConfig::default().bridge();
        bridge.executor.working_dir = PathBuf::from("/srv/brain");
        assert_eq!(bridge.command_cwd(Some("/tmp")), PathBuf::from("/tmp"));
        assert_eq!(bridge.command_cwd(Some("  ")), PathBuf::from("/srv/brain"));
        assert_eq!(bridge.command_cwd(None), PathBuf::from("/srv/brain"));

        bridge.command.default_cwd = Some(PathBuf::from("/var/tmp"));
        assert_eq!(bridge.command_cwd(None), PathBuf::from("/var/tmp"));
    }
}
