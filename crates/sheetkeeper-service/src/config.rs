use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::mapping::KeyCase;

/// The environment variable consulted for [`ApiConfig::auth_token`] when the config has none.
pub const AUTH_TOKEN_ENV: &str = "SHEETKEEPER_AUTH_TOKEN";

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "sheetkeeper".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// How to reach the spreadsheet API.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// The API root, the `v4/spreadsheets/...` paths are appended to it.
    pub base_url: Url,
    /// A bearer token sent with every request.
    ///
    /// Defaults to the `SHEETKEEPER_AUTH_TOKEN` environment variable.
    pub auth_token: Option<String>,
    /// The timeout for a whole request.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: default_base_url(),
            auth_token: env::var(AUTH_TOKEN_ENV).ok(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

fn default_base_url() -> Url {
    Url::parse("https://sheets.googleapis.com/").expect("default base URL is valid")
}

/// The sheet to read from and append to.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SheetConfig {
    /// The identifier of the spreadsheet document.
    pub spreadsheet_id: String,
    /// The range holding the header and data rows, in A1 notation.
    pub range: String,
    /// The 1-based row within `range` that holds the column names.
    ///
    /// All rows up to and including it are skipped when reading data. `0` means there is no
    /// header, which disables column names and row objects.
    pub header_rows: usize,
    /// How header cells are turned into field names.
    pub key_transform: KeyCase,
    /// Fetch the sheet in the background right away.
    pub preload: bool,
    /// Refresh the cached rows in the background on this interval.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,
    /// Refetch cached rows on access once they are older than this.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// The `strftime` format used for date cells on append.
    pub date_format: String,
}

impl Default for SheetConfig {
    fn default() -> Self {
        SheetConfig {
            spreadsheet_id: String::new(),
            range: "Sheet1".into(),
            header_rows: 1,
            key_transform: KeyCase::Identity,
            preload: false,
            refresh_interval: None,
            max_age: None,
            date_format: "%Y-%m-%d %H:%M:%S".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configures the logging system.
    pub logging: Logging,

    /// Configures the metrics system.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    /// Configures the spreadsheet API client.
    pub api: ApiConfig,

    /// The sheet to work with.
    pub sheet: SheetConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
