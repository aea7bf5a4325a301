//! Tunables of the OC subsystem.
use crate::constraints::MAXIMUM_LINEAR_MEMORY_PAGES;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration shared by the code cache, the compile monitor and the
/// executors.
///
/// The whole value travels with every compile request so the monitor can
/// apply the limits of the requesting node. In TOML durations are written
/// in milliseconds:
///
/// ```toml
/// cache_size = 1073741824
/// threads = 2
/// cpu_limit = 20000
/// compile_timeout = 30000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcConfig {
    /// Size of the code cache file in bytes.
    pub cache_size: u64,
    /// Number of compiles a monitor session runs concurrently.
    pub threads: u64,
    /// Wall clock budget for one compile.
    #[serde(with = "opt_millis")]
    pub cpu_limit: Option<Duration>,
    /// Upper bound on the wasm plus initial memory image accepted for compilation.
    pub vm_limit: Option<u64>,
    /// Stack size of the compile worker.
    pub stack_size_limit: Option<u64>,
    /// Upper bound on the native code produced for one module.
    pub generated_code_size_limit: Option<u64>,
    /// Bound on every wait for a reply from the compile monitor.
    #[serde(with = "millis")]
    pub compile_timeout: Duration,
    /// Memory slices reserved for the main thread.
    pub main_thread_sliced_pages: u64,
}

impl Default for OcConfig {
    fn default() -> Self {
        Self {
            cache_size: 1024 * 1024 * 1024,
            threads: 1,
            cpu_limit: None,
            vm_limit: None,
            stack_size_limit: None,
            generated_code_size_limit: None,
            compile_timeout: Duration::from_secs(30),
            main_thread_sliced_pages: MAXIMUM_LINEAR_MEMORY_PAGES,
        }
    }
}

impl OcConfig {
    /// Parses a configuration from a TOML document. Missing keys take
    /// their default value.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1".into()));
        }
        if self.main_thread_sliced_pages == 0
            || self.main_thread_sliced_pages > MAXIMUM_LINEAR_MEMORY_PAGES
        {
            return Err(ConfigError::Invalid(format!(
                "main_thread_sliced_pages must be within 1..={MAXIMUM_LINEAR_MEMORY_PAGES}"
            )));
        }
        if self.compile_timeout.is_zero() {
            return Err(ConfigError::Invalid("compile_timeout must not be zero".into()));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
