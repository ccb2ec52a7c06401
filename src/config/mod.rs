use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const DEFAULT_CONFIG_FILE: &str = "redmq.toml";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: MqServerConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub engine: String,
    pub url: String,
    pub connect_timeout_ms: u64,
    pub max_idle_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: "redis".to_owned(),
            url: "redis://127.0.0.1:6379/".to_owned(),
            connect_timeout_ms: 2_000,
            max_idle_connections: 16,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MqServerConfig {
    pub retry_count: u32,
    pub disable_priority_queues: bool,
    pub priority_queue_whitelist: Vec<String>,
    pub publish_responses: bool,
    pub pop_timeout_ms: u64,
    pub subscription_poll_ms: u64,
    pub worker_stop_grace_ms: u64,
    pub dispose_timeout_ms: u64,
}

impl Default for MqServerConfig {
    fn default() -> Self {
        Self {
            retry_count: 2,
            disable_priority_queues: false,
            priority_queue_whitelist: Vec::new(),
            publish_responses: true,
            pop_timeout_ms: 500,
            subscription_poll_ms: 1_000,
            worker_stop_grace_ms: 50,
            dispose_timeout_ms: 3_000,
        }
    }
}

impl AppConfig {
    /// Resolves the config file from `--config <path>` (first pair only) or falls back to
    /// `redmq.toml` in the working directory. Remaining args are treated as overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();
        let path = if args.first().map(String::as_str) == Some("--config") {
            if args.len() < 2 {
                return Err(ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                });
            }
            let path = PathBuf::from(args.remove(1));
            args.remove(0);
            path
        } else {
            PathBuf::from(DEFAULT_CONFIG_FILE)
        };

        Self::load_from_toml_with_args(path, args)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        Self::from_toml_str_with_args(&toml_content, path.as_ref(), args)
    }

    fn from_toml_str_with_args(
        toml_content: &str,
        path: &Path,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.to_string_lossy().to_string(),
                    source,
                })?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

// Overrides may only touch keys present in the file so typos fail loudly.
fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.is_empty() || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table.get_mut(*section).ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    *current_value = parsed_value;

    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
        Value::Array(_) => Ok(Value::Array(
            raw_value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_owned()))
                .collect(),
        )),
        Value::Datetime(_) | Value::Table(_) => Err(ConfigError::UnsupportedOverrideType {
            key: key_path.to_owned(),
        }),
    }
}
