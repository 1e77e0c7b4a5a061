//! Port configuration
//!
//! Loaded from the JSON file named by `KEYRING_CONFIG` when set, otherwise
//! defaults; `KEYRING_BACKEND` and `KEYRING_START_INDEX` override the file.

use keyring_core::KeyIndex;
use keyring_hardware_hal::simulator::DEFAULT_TRANSIENT_SLOTS;
use keyring_hardware_hal::SimulatedHsm;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable naming the JSON configuration file
pub const CONFIG_PATH_ENV: &str = "KEYRING_CONFIG";
/// Environment override for [`KeyringConfig::backend`]
pub const BACKEND_ENV: &str = "KEYRING_BACKEND";
/// Environment override for [`KeyringConfig::start_index`]
pub const START_INDEX_ENV: &str = "KEYRING_START_INDEX";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid JSON for this schema
    #[error("Invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    /// A field holds an unusable value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// HSM backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Software model
    Simulator,
    /// TPM 2.0 through tss-esapi (requires the `tpm` feature)
    Tpm,
}

/// Port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    /// Backend to open
    pub backend: BackendKind,
    /// Window start used when `initialize_on_start` is set
    pub start_index: KeyIndex,
    /// Initialize the window before the first request instead of waiting
    /// for an initialize request
    pub initialize_on_start: bool,
    /// TCTI configuration string, e.g. `device:/dev/tpmrm0`
    pub tcti: Option<String>,
    /// Hex-encoded 32-byte endorsement seed for the simulator; random if unset
    pub simulator_seed: Option<String>,
    /// Transient slots exposed by the simulator
    pub simulator_slots: usize,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        KeyringConfig {
            backend: BackendKind::Simulator,
            start_index: 1,
            initialize_on_start: false,
            tcti: None,
            simulator_seed: None,
            simulator_slots: DEFAULT_TRANSIENT_SLOTS,
        }
    }
}

impl KeyringConfig {
    /// Load from the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parse a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse JSON configuration text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply environment-style overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(BACKEND_ENV) {
            self.backend = match backend.trim().to_ascii_lowercase().as_str() {
                "simulator" => BackendKind::Simulator,
                "tpm" => BackendKind::Tpm,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "backend",
                        reason: format!("unknown backend {:?}", other),
                    })
                }
            };
        }

        if let Some(index) = lookup(START_INDEX_ENV) {
            self.start_index = index.trim().parse().map_err(|e| ConfigError::InvalidValue {
                field: "start_index",
                reason: format!("{}", e),
            })?;
            self.initialize_on_start = true;
        }

        Ok(())
    }

    /// Decoded simulator seed, if configured
    pub fn simulator_seed_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(seed) = &self.simulator_seed else {
            return Ok(None);
        };

        let bytes = hex::decode(seed.trim()).map_err(|e| ConfigError::InvalidValue {
            field: "simulator_seed",
            reason: e.to_string(),
        })?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| ConfigError::InvalidValue {
            field: "simulator_seed",
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
        Ok(Some(seed))
    }

    /// Build the simulator backend described by this configuration
    pub fn open_simulator(&self) -> Result<SimulatedHsm, ConfigError> {
        if self.simulator_slots < 3 {
            return Err(ConfigError::InvalidValue {
                field: "simulator_slots",
                reason: "the key window needs at least 3 transient slots".to_string(),
            });
        }

        let hsm = match self.simulator_seed_bytes()? {
            Some(seed) => SimulatedHsm::new(seed),
            None => {
                log::warn!("simulator seed not configured; keys will not survive a restart");
                SimulatedHsm::from_entropy()
            }
        };
        Ok(hsm.with_transient_slots(self.simulator_slots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = KeyringConfig::from_json("{}").unwrap();
        assert_eq!(config, KeyringConfig::default());
        assert_eq!(config.backend, BackendKind::Simulator);
    }

    #[test]
    fn test_parse_file_fields() {
        let config = KeyringConfig::from_json(
            r#"{"backend": "tpm", "start_index": 12, "tcti": "device:/dev/tpmrm0"}"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Tpm);
        assert_eq!(config.start_index, 12);
        assert_eq!(config.tcti.as_deref(), Some("device:/dev/tpmrm0"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(BACKEND_ENV, "TPM"), (START_INDEX_ENV, "40")].into();
        let mut config = KeyringConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend, BackendKind::Tpm);
        assert_eq!(config.start_index, 40);
        assert!(config.initialize_on_start);
    }

    #[test]
    fn test_bad_overrides() {
        let mut config = KeyringConfig::default();
        assert!(config
            .apply_overrides(|name| (name == BACKEND_ENV).then(|| "pkcs11".to_string()))
            .is_err());
        assert!(config
            .apply_overrides(|name| (name == START_INDEX_ENV).then(|| "70000".to_string()))
            .is_err());
    }

    #[test]
    fn test_simulator_seed() {
        let mut config = KeyringConfig::default();
        config.simulator_seed = Some("ab".repeat(32));
        assert_eq!(config.simulator_seed_bytes().unwrap(), Some([0xAB; 32]));

        config.simulator_seed = Some("abcd".to_string());
        assert!(config.simulator_seed_bytes().is_err());
        assert!(config.open_simulator().is_err());
    }

    #[test]
    fn test_simulator_needs_three_slots() {
        let config = KeyringConfig {
            simulator_slots: 2,
            ..KeyringConfig::default()
        };
        assert!(config.open_simulator().is_err());
    }
}
