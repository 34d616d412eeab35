use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::cli::{Cli, LogFormat};
use crate::util::parse_duration;

const DEFAULT_CONFIG_FILE: &str = "cacheproxy.toml";
const ENV_PREFIX: &str = "CACHEPROXY";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_cache_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_cache_sweeper_interval() -> u64 {
    300
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// How long a cached response stays fresh: integer seconds or a string like `"500ms"`.
    #[serde(default = "default_cache_timeout", deserialize_with = "deserialize_duration")]
    pub cache_timeout: Duration,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    /// Seconds between background purges of expired entries; 0 disables the sweeper.
    #[serde(default = "default_cache_sweeper_interval")]
    pub cache_sweeper_interval: u64,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cache_timeout: default_cache_timeout(),
            debug: false,
            log: default_log_format(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            max_header_size: default_max_header_size(),
            max_response_header_size: default_max_response_header_size(),
            max_request_body_size: default_max_request_body_size(),
            cache_sweeper_interval: default_cache_sweeper_interval(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    /// Layers serde defaults, the config file, `CACHEPROXY__*` environment variables and
    /// command-line flags, in increasing order of precedence.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match cli.config.as_deref() {
            Some(path) => builder.add_source(File::from(path.to_path_buf()).required(true)),
            None => builder.add_source(File::from(PathBuf::from(DEFAULT_CONFIG_FILE)).required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let timeout = cli
            .timeout
            .map(|timeout| humantime::format_duration(timeout).to_string());
        builder = builder
            .set_override_option("listen", cli.listen.map(|addr| addr.to_string()))
            .map_err(to_anyhow)?
            .set_override_option("cache_timeout", timeout)
            .map_err(to_anyhow)?
            .set_override_option("debug", cli.log.then_some(true))
            .map_err(to_anyhow)?
            .set_override_option("log", cli.log_format.map(|format| format.as_str()))
            .map_err(to_anyhow)?;

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn cache_timeout(&self) -> Duration {
        self.cache_timeout
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn cache_sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweeper_interval)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.cache_timeout.is_zero(),
            "cache_timeout must be greater than 0 (got {})",
            humantime::format_duration(self.cache_timeout)
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationValue::deserialize(deserializer)? {
        DurationValue::Seconds(secs) => Ok(Duration::from_secs(secs)),
        DurationValue::Text(text) => {
            parse_duration(&text).map_err(|err| serde::de::Error::custom(format!("{err:#}")))
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    fn cli_for(file: &tempfile::NamedTempFile) -> Cli {
        Cli {
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(settings.cache_timeout(), Duration::from_secs(60));
        assert_eq!(settings.log, LogFormat::Text);
        assert!(!settings.debug);
    }

    #[test]
    fn loads_file_values_over_defaults() -> Result<()> {
        let file = write_config(
            r#"
listen = "127.0.0.1:3128"
cache_timeout = 5
log = "json"
cache_sweeper_interval = 0
metrics_listen = "127.0.0.1:9100"
"#,
        )?;
        let settings = Settings::load(&cli_for(&file))?;
        assert_eq!(settings.listen, "127.0.0.1:3128".parse()?);
        assert_eq!(settings.cache_timeout(), Duration::from_secs(5));
        assert_eq!(settings.log, LogFormat::Json);
        assert_eq!(settings.cache_sweeper_interval(), Duration::ZERO);
        assert_eq!(settings.metrics_listen, Some("127.0.0.1:9100".parse()?));
        assert_eq!(settings.client_timeout(), Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn command_line_overrides_file() -> Result<()> {
        let file = write_config("cache_timeout = 5\nlog = \"json\"\n")?;
        let cli = Cli {
            listen: Some("0.0.0.0:8081".parse()?),
            timeout: Some(Duration::from_millis(1500)),
            log: true,
            log_format: Some(LogFormat::Text),
            ..cli_for(&file)
        };
        let settings = Settings::load(&cli)?;
        assert_eq!(settings.listen, "0.0.0.0:8081".parse()?);
        assert_eq!(settings.cache_timeout(), Duration::from_millis(1500));
        assert!(settings.debug);
        assert_eq!(settings.log, LogFormat::Text);
        Ok(())
    }

    #[test]
    fn cache_timeout_accepts_duration_strings() -> Result<()> {
        let file = write_config("cache_timeout = \"750ms\"\n")?;
        let settings = Settings::load(&cli_for(&file))?;
        assert_eq!(settings.cache_timeout(), Duration::from_millis(750));

        let file = write_config("cache_timeout = \"eventually\"\n")?;
        let err = Settings::load(&cli_for(&file)).expect_err("garbage duration should fail");
        assert!(
            format!("{err:#}").contains("invalid duration 'eventually'"),
            "unexpected error: {err:#}"
        );
        Ok(())
    }

    #[test]
    fn explicit_config_path_must_exist() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/cacheproxy.toml")),
            ..Cli::default()
        };
        assert!(Settings::load(&cli).is_err());
    }

    #[test]
    fn zero_values_are_rejected() -> Result<()> {
        let file = write_config("upstream_timeout = 0\n")?;
        let err = Settings::load(&cli_for(&file)).expect_err("zero timeout should be rejected");
        assert!(
            err.to_string().contains("upstream_timeout must be greater than 0"),
            "unexpected error: {err}"
        );

        let settings = Settings {
            cache_timeout: Duration::ZERO,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            max_request_body_size: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        Ok(())
    }
}
