//! Configuration loading, validation and hot update.

pub mod manager;

pub use manager::ConfigManager;

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("field {field}: expected {expected}")]
    TypeMismatch { field: String, expected: String },
    #[error("field {field} = {value} out of range [{}, {}]", min.as_deref().unwrap_or("-inf"), max.as_deref().unwrap_or("+inf"))]
    OutOfRange {
        field: String,
        value: String,
        min: Option<String>,
        max: Option<String>,
    },
    #[error("field {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn out_of_range(
        field: &str,
        value: impl ToString,
        min: Option<impl ToString>,
        max: Option<impl ToString>,
    ) -> Self {
        ConfigError::OutOfRange {
            field: field.into(),
            value: value.to_string(),
            min: min.map(|m| m.to_string()),
            max: max.map(|m| m.to_string()),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A configuration section that can be loaded from TOML, validated and
/// partially replaced at runtime.
pub trait Config: Sized + Send + Sync + 'static {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError>;

    /// Copy the hot-updatable fields of `other` into `self`. Everything else
    /// keeps its startup value.
    fn hot_update(&mut self, other: &Self);

    fn render(&self) -> String;

    fn validate(&self) -> Result<(), ConfigError>;
}

/// `from_toml` for serde-derived sections; missing keys take their defaults.
pub fn from_toml_value<T: DeserializeOwned>(value: &toml::Value) -> Result<T, ConfigError> {
    Ok(value.clone().try_into()?)
}

/// `render` for serde-derived sections.
pub fn render_toml<T: Serialize>(cfg: &T) -> String {
    toml::to_string(cfg).unwrap_or_else(|e| format!("# render failed: {}", e))
}
