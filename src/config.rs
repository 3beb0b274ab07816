//! Configuration for sluice.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file: explicit path, else `SLUICE_CONFIG_PATH`, else `./sluice.toml` if present
//! 3. Environment variables: `SLUICE__<SECTION>__<KEY>`, e.g. `SLUICE__BULK__MAX_BATCH_ROWS`
//! 4. Builder overrides (CLI flags)
//!
//! A `.env` file in the working directory is loaded before the environment is read.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::controller::{ControllerOptions, DEFAULT_ACCUMULATOR};
use crate::executor::remote::{BulkSettings, Credentials};

const DEFAULT_CONFIG_FILE: &str = "sluice.toml";
const CONFIG_PATH_VAR: &str = "SLUICE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub local: LocalConfig,
    pub bulk: BulkConfig,
    pub job: JobConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process SQLite
    #[default]
    Embedded,
    /// External `sqlite3` command-line shell
    Sqlite3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub data_dir: PathBuf,
    pub engine: EngineKind,
    pub sqlite3_path: PathBuf,
    pub cleanup_scratch: bool,
    pub reuse_cached: bool,
    /// Table files in `data_dir` prepared outside sluice
    pub inputs: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            engine: EngineKind::Embedded,
            sqlite3_path: PathBuf::from("sqlite3"),
            cleanup_scratch: false,
            reuse_cached: false,
            inputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    pub max_batch_rows: usize,
    pub poll_interval_ms: u64,
    /// 0 waits forever
    pub poll_timeout_secs: u64,
    pub relogin_delay_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_batch_rows: 10_000,
            poll_interval_ms: 2_000,
            poll_timeout_secs: 3_600,
            relogin_delay_secs: 120,
            http_timeout_secs: 300,
        }
    }
}

impl BulkConfig {
    pub fn settings(&self) -> BulkSettings {
        BulkSettings {
            max_batch_rows: self.max_batch_rows,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_timeout: match self.poll_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            relogin_delay: Duration::from_secs(self.relogin_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub accumulator: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            accumulator: DEFAULT_ACCUMULATOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Endpoint name read by `src.<Object>` queries
    pub src: Option<String>,
    /// Endpoint name for `dst.<Object>` queries and all remote sinks
    pub dst: Option<String>,
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub login_url: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
    pub api_version: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            login_url: "https://login.salesforce.com".to_string(),
            username: String::new(),
            password: String::new(),
            security_token: String::new(),
            api_version: "38.0".to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            login_url: self.login_url.trim_end_matches('/').to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            security_token: self.security_token.clone(),
            api_version: self.api_version.clone(),
        }
    }
}

impl RemoteConfig {
    /// Look up the endpoint selected by `name`, failing on unknown names.
    pub fn endpoint(&self, name: Option<&str>) -> Result<Option<&EndpointConfig>> {
        let Some(name) = name else {
            return Ok(None);
        };
        match self.endpoints.get(name) {
            Some(endpoint) => Ok(Some(endpoint)),
            None => bail!(
                "remote endpoint '{}' is not defined under [remote.endpoints]",
                name
            ),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load from the default sources with no overrides.
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    /// Controller options derived from this configuration.
    pub fn controller_options(&self) -> ControllerOptions {
        let mut options = ControllerOptions::new(self.local.data_dir.clone())
            .accumulator(self.job.accumulator.clone())
            .reuse_cached(self.local.reuse_cached)
            .cleanup_scratch(self.local.cleanup_scratch);
        for name in &self.local.inputs {
            options = options.input(name.clone());
        }
        options
    }

    /// Effective configuration as TOML. Passwords and tokens are masked.
    pub fn to_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        for endpoint in shown.remote.endpoints.values_mut() {
            for secret in [&mut endpoint.password, &mut endpoint.security_token] {
                if !secret.is_empty() {
                    *secret = "********".to_string();
                }
            }
        }
        toml::to_string_pretty(&shown).context("Failed to render configuration")
    }

    fn validate(&self) -> Result<()> {
        if self.bulk.max_batch_rows == 0 {
            bail!("bulk.max_batch_rows must be at least 1");
        }
        if self.job.accumulator.trim().is_empty() {
            bail!("job.accumulator must not be empty");
        }
        for (name, endpoint) in &self.remote.endpoints {
            if endpoint.username.is_empty() {
                bail!("remote endpoint '{}' has no username", name);
            }
        }
        self.remote.endpoint(self.remote.src.as_deref())?;
        self.remote.endpoint(self.remote.dst.as_deref())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    src: Option<String>,
    dst: Option<String>,
    accumulator: Option<String>,
}

impl ConfigBuilder {
    /// Config file to read instead of the default search.
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn data_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.data_dir = dir;
        self
    }

    /// Endpoint name used for `src`.
    pub fn src(mut self, name: Option<String>) -> Self {
        self.src = name;
        self
    }

    /// Endpoint name used for `dst`.
    pub fn dst(mut self, name: Option<String>) -> Self {
        self.dst = name;
        self
    }

    pub fn accumulator(mut self, name: Option<String>) -> Self {
        self.accumulator = name;
        self
    }

    pub fn build(self) -> Result<Config> {
        let _ = dotenvy::dotenv();

        let mut builder = ::config::Config::builder();
        builder = match self.config_file() {
            Some((path, required)) => builder.add_source(
                ::config::File::from(path.as_path())
                    .format(::config::FileFormat::Toml)
                    .required(required),
            ),
            None => builder,
        };
        builder = builder.add_source(
            ::config::Environment::with_prefix("SLUICE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(dir) = self.data_dir {
            config.local.data_dir = dir;
        }
        if let Some(src) = self.src {
            config.remote.src = Some(src);
        }
        if let Some(dst) = self.dst {
            config.remote.dst = Some(dst);
        }
        if let Some(accumulator) = self.accumulator {
            config.job.accumulator = accumulator;
        }

        config.validate()?;
        Ok(config)
    }

    /// The file to read and whether it must exist.
    fn config_file(&self) -> Option<(PathBuf, bool)> {
        if let Some(path) = &self.config_path {
            return Some((path.clone(), true));
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return Some((PathBuf::from(path), true));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.is_file().then_some((default, false))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.local.engine, EngineKind::Embedded);
        assert_eq!(config.job.accumulator, "batch_params");

        let settings = config.bulk.settings();
        assert_eq!(settings.max_batch_rows, 10_000);
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.poll_timeout, Some(Duration::from_secs(3_600)));
        assert_eq!(settings.relogin_delay, Duration::from_secs(120));
    }

    #[test]
    fn test_file_values_and_overrides() {
        let file = write_config(
            r#"
[local]
data_dir = "/tmp/from-file"
engine = "sqlite3"

[bulk]
max_batch_rows = 500
poll_timeout_secs = 0

[remote]
src = "prod"

[remote.endpoints.prod]
username = "etl@example.com"
password = "secret"

[remote.endpoints.sandbox]
login_url = "https://test.salesforce.com/"
username = "etl@example.com.sandbox"
"#,
        );

        let config = Config::builder()
            .config_path(Some(file.path().to_path_buf()))
            .data_dir(Some(PathBuf::from("/tmp/from-cli")))
            .dst(Some("sandbox".to_string()))
            .build()
            .unwrap();

        assert_eq!(config.local.data_dir, PathBuf::from("/tmp/from-cli"));
        assert_eq!(config.local.engine, EngineKind::Sqlite3);
        assert_eq!(config.bulk.settings().max_batch_rows, 500);
        assert_eq!(config.bulk.settings().poll_timeout, None);

        let src = config.remote.endpoint(config.remote.src.as_deref()).unwrap().unwrap();
        assert_eq!(src.api_version, "38.0");
        let dst = config.remote.endpoint(config.remote.dst.as_deref()).unwrap().unwrap();
        assert_eq!(dst.credentials().login_url, "https://test.salesforce.com");
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let file = write_config("[remote]\nsrc = \"missing\"\n");
        let err = Config::builder()
            .config_path(Some(file.path().to_path_buf()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("missing"), "got: {err}");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::builder()
            .config_path(Some(PathBuf::from("/nonexistent/sluice.toml")))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_to_toml_masks_secrets() {
        let mut config = Config::default();
        config.remote.endpoints.insert(
            "prod".to_string(),
            EndpointConfig {
                username: "etl@example.com".to_string(),
                password: "hunter2".to_string(),
                ..Default::default()
            },
        );
        let text = config.to_toml().unwrap();
        assert!(text.contains("etl@example.com"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("[bulk]"));
    }

    #[test]
    fn test_controller_options_follow_config() {
        let mut config = Config::default();
        config.job.accumulator = "ids".to_string();
        config.local.cleanup_scratch = true;
        config.local.inputs = vec!["accounts".to_string()];
        let options = config.controller_options();
        assert_eq!(options.accumulator, "ids");
        assert_eq!(options.inputs, vec!["accounts".to_string()]);
        assert!(options.cleanup_scratch);
        assert!(!options.reuse_cached);
    }
}
