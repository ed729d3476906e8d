//! Control layer configuration
//!
//! Buffer sizing for the kernel queries and the handle-accessor policy, with
//! YAML load/save.

use crate::mptcp::{Priority, RestoreMode};
use serde::{Deserialize, Serialize};

/// Smallest tuple buffer that can hold the header plus two `sockaddr_in`
const MIN_TUPLE_BUFFER_LEN: usize = 2 + 2 * 16;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// Subflow control configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Initial size in bytes of the subflow-list query buffer
    #[serde(default = "default_list_buffer_min")]
    pub list_buffer_min: usize,
    /// Growth step when the facility reports the list buffer too small
    #[serde(default = "default_list_buffer_increment")]
    pub list_buffer_increment: usize,
    /// Upper bound for the list buffer
    #[serde(default = "default_list_buffer_max")]
    pub list_buffer_max: usize,
    /// Size in bytes of the path-tuple query buffer
    #[serde(default = "default_tuple_buffer_len")]
    pub tuple_buffer_len: usize,
    /// Blocking disposition restored after each control call
    #[serde(default)]
    pub restore_mode: RestoreMode,
    /// Priority used when the caller does not pick one
    #[serde(default)]
    pub default_priority: Priority,
}

fn default_list_buffer_min() -> usize {
    40
}

fn default_list_buffer_increment() -> usize {
    20
}

fn default_list_buffer_max() -> usize {
    4096
}

fn default_tuple_buffer_len() -> usize {
    2 * 28 + 40
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            list_buffer_min: default_list_buffer_min(),
            list_buffer_increment: default_list_buffer_increment(),
            list_buffer_max: default_list_buffer_max(),
            tuple_buffer_len: default_tuple_buffer_len(),
            restore_mode: RestoreMode::default(),
            default_priority: Priority::default(),
        }
    }
}

impl ControlConfig {
    pub fn builder() -> ControlConfigBuilder {
        ControlConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.list_buffer_min == 0 {
            return Err(ConfigError::Invalid("list_buffer_min must be > 0".to_string()));
        }
        if self.list_buffer_increment == 0 {
            return Err(ConfigError::Invalid("list_buffer_increment must be > 0".to_string()));
        }
        if self.list_buffer_max < self.list_buffer_min {
            return Err(ConfigError::Invalid(format!(
                "list_buffer_max ({}) is smaller than list_buffer_min ({})",
                self.list_buffer_max, self.list_buffer_min
            )));
        }
        if self.tuple_buffer_len < MIN_TUPLE_BUFFER_LEN {
            return Err(ConfigError::Invalid(format!(
                "tuple_buffer_len must be at least {}",
                MIN_TUPLE_BUFFER_LEN
            )));
        }
        Ok(())
    }

    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: &str) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

/// Builder for ControlConfig
#[derive(Debug, Default)]
pub struct ControlConfigBuilder {
    list_buffer_min: Option<usize>,
    list_buffer_increment: Option<usize>,
    list_buffer_max: Option<usize>,
    tuple_buffer_len: Option<usize>,
    restore_mode: Option<RestoreMode>,
    default_priority: Option<Priority>,
}

impl ControlConfigBuilder {
    pub fn list_buffer_min(mut self, size: usize) -> Self {
        self.list_buffer_min = Some(size);
        self
    }

    pub fn list_buffer_increment(mut self, step: usize) -> Self {
        self.list_buffer_increment = Some(step);
        self
    }

    pub fn list_buffer_max(mut self, size: usize) -> Self {
        self.list_buffer_max = Some(size);
        self
    }

    pub fn tuple_buffer_len(mut self, size: usize) -> Self {
        self.tuple_buffer_len = Some(size);
        self
    }

    pub fn restore_mode(mut self, mode: RestoreMode) -> Self {
        self.restore_mode = Some(mode);
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = Some(priority);
        self
    }

    pub fn build(self) -> ControlConfig {
        let default = ControlConfig::default();
        ControlConfig {
            list_buffer_min: self.list_buffer_min.unwrap_or(default.list_buffer_min),
            list_buffer_increment: self
                .list_buffer_increment
                .unwrap_or(default.list_buffer_increment),
            list_buffer_max: self.list_buffer_max.unwrap_or(default.list_buffer_max),
            tuple_buffer_len: self.tuple_buffer_len.unwrap_or(default.tuple_buffer_len),
            restore_mode: self.restore_mode.unwrap_or(default.restore_mode),
            default_priority: self.default_priority.unwrap_or(default.default_priority),
        }
    }
}
