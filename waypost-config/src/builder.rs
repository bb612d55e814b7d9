// Layered configuration builder

use crate::{ConfigError, ConfigManager, FileFormat, Result};
use serde_json::Value;
use std::path::PathBuf;

enum Source {
    Defaults(Value),
    File {
        path: PathBuf,
        format: Option<FileFormat>,
        required: bool,
    },
    Dotenv(Option<PathBuf>),
    Env,
}

/// Builds a [`ConfigManager`] from layered sources
///
/// Sources are applied in the order they are added; later sources override
/// earlier ones key by key.
///
/// ```rust,ignore
/// let config = ConfigBuilder::new()
///     .with_prefix("WAYPOST")
///     .add_file("waypost.toml")
///     .load_dotenv(None)
///     .build()?;
/// ```
pub struct ConfigBuilder {
    prefix: Option<String>,
    sources: Vec<Source>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            prefix: None,
            sources: Vec::new(),
        }
    }

    /// Only read environment variables starting with `prefix_`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Base values, typically `serde_json::json!({...})` or a serialized struct
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.sources.push(Source::Defaults(defaults));
        self
    }

    /// Add a configuration file; the format follows the extension
    pub fn add_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(Source::File {
            path: path.into(),
            format: None,
            required: true,
        });
        self
    }

    /// Add a configuration file of an explicit format
    pub fn add_file_as(mut self, path: impl Into<PathBuf>, format: FileFormat) -> Self {
        self.sources.push(Source::File {
            path: path.into(),
            format: Some(format),
            required: true,
        });
        self
    }

    /// Add a configuration file that is skipped when absent
    pub fn add_optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(Source::File {
            path: path.into(),
            format: None,
            required: false,
        });
        self
    }

    /// Load a `.env` file, then the environment
    pub fn load_dotenv(mut self, path: Option<PathBuf>) -> Self {
        self.sources.push(Source::Dotenv(path));
        self
    }

    /// Load environment variables
    pub fn load_env(mut self) -> Self {
        self.sources.push(Source::Env);
        self
    }

    pub fn build(self) -> Result<ConfigManager> {
        let manager = match self.prefix {
            Some(prefix) => ConfigManager::with_prefix(prefix),
            None => ConfigManager::new(),
        };

        for source in self.sources {
            match source {
                Source::Defaults(value) => manager.merge_value(value)?,
                Source::File {
                    path,
                    format,
                    required,
                } => {
                    if !required && !path.exists() {
                        continue;
                    }
                    match format {
                        Some(format) => manager.load_file_as(&path, format)?,
                        None => manager.load_file(&path)?,
                    }
                }
                Source::Dotenv(path) => manager.load_dotenv(path.as_deref())?,
                Source::Env => manager.load_env()?,
            }
        }

        Ok(manager)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<ConfigBuilder> for ConfigManager {
    type Error = ConfigError;

    fn try_from(builder: ConfigBuilder) -> Result<Self> {
        builder.build()
    }
}
