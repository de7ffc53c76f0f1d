use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::Figment;
use figment::providers::{Env, Format, Json};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::session::YggSession;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file '{0}' not found")]
    NotFound(String),

    #[error("error parsing config file '{path}'")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error reading config file '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Immutable view over a loaded JSON configuration. Cloning is cheap; there
/// is no way to mutate the underlying value through this type.
#[derive(Debug, Clone)]
pub struct Config {
    root: Arc<Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self::empty()
    }
}

impl Config {
    pub fn empty() -> Self {
        Self {
            root: Arc::new(Value::Object(Default::default())),
        }
    }

    pub fn from_value(value: Value) -> Self {
        Self {
            root: Arc::new(value),
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Walk a dotted path (`"details.library_construction_method"`).
    pub fn at(&self, dotted_path: &str) -> Option<&Value> {
        let mut current: &Value = &self.root;
        for key in dotted_path.split('.') {
            current = current.get(key)?;
        }
        Some(current)
    }

    pub fn str_at(&self, dotted_path: &str) -> Option<&str> {
        self.at(dotted_path).and_then(Value::as_str)
    }

    pub fn str_or(&self, dotted_path: &str, default: &str) -> String {
        self.str_at(dotted_path).unwrap_or(default).to_string()
    }

    pub fn bool_at(&self, dotted_path: &str) -> Option<bool> {
        self.at(dotted_path).and_then(Value::as_bool)
    }

    pub fn f64_at(&self, dotted_path: &str) -> Option<f64> {
        self.at(dotted_path).and_then(Value::as_f64)
    }

    pub fn array_at(&self, dotted_path: &str) -> Option<&Vec<Value>> {
        self.at(dotted_path).and_then(Value::as_array)
    }
}

/// Loads JSON configurations by logical name from the configuration
/// directory. With dev mode on, a `dev_`-prefixed sibling file shadows the
/// requested one when it exists.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn config_dir() -> PathBuf {
        std::env::var_os("YGG_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("yggdrasil_workspace/common/configurations"))
    }

    fn resolve_dev_variant(path: &Path) -> PathBuf {
        if !YggSession::is_dev() {
            return path.to_path_buf();
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return path.to_path_buf();
        };
        let dev_path = path.with_file_name(format!("dev_{file_name}"));
        if dev_path.is_file() {
            info!(
                "Dev mode ON. Loading dev config '{}' instead of '{file_name}'.",
                dev_path.file_name().unwrap_or_default().to_string_lossy()
            );
            dev_path
        } else {
            debug!("Dev mode ON but no dev config found for '{file_name}'.");
            path.to_path_buf()
        }
    }

    pub fn load_config(file_name: &str) -> Result<Config, ConfigError> {
        Self::load_config_path(Self::config_dir().join(file_name))
    }

    /// Like `load_config`, but a missing file yields an empty configuration
    /// instead of an error. Parse failures are still not acceptable; they are
    /// logged and also yield an empty configuration so startup can proceed.
    pub fn load_config_optional(file_name: &str) -> Config {
        match Self::load_config(file_name) {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => {
                debug!("Optional config '{file_name}' not present.");
                Config::empty()
            }
            Err(err) => {
                error!("{err}");
                Config::empty()
            }
        }
    }

    /// Load from an explicit path, bypassing the logical-name lookup. The dev
    /// overlay still applies.
    pub fn load_config_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = Self::resolve_dev_variant(path.as_ref());
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Config::from_value(value))
    }
}

/// Connection settings for the CouchDB server, from the `couchdb` table of
/// `main.json` with `YGG_COUCHDB_*` environment variables taking precedence.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CouchSettings {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_projects_db")]
    pub projects_db: String,
    #[serde(default = "default_yggdrasil_db")]
    pub yggdrasil_db: String,
}

fn default_projects_db() -> String {
    "projects".to_string()
}

fn default_yggdrasil_db() -> String {
    "yggdrasil".to_string()
}

impl CouchSettings {
    pub fn figment() -> Figment {
        let path = ConfigLoader::resolve_dev_variant(&ConfigLoader::config_dir().join("main.json"));
        Figment::from(Json::file(path))
            .focus("couchdb")
            .merge(Env::prefixed("YGG_COUCHDB_"))
    }

    pub fn load() -> figment::Result<Self> {
        Self::figment().extract()
    }
}
