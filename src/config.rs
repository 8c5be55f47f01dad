//! Device configuration
//!
//! Settings pushed to the kernel when a device is created and connected.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BlockError, BlockResult};
use crate::nbd::TransmissionFlags;

/// Per-device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Advertise TRIM/discard support
    pub trim_enabled: bool,
    /// Advertise FLUSH support
    pub flush_enabled: bool,
    /// Advertise FUA write-through; implies FLUSH
    pub fua_enabled: bool,
    /// Expose the device read-only
    pub read_only: bool,
    /// Logical block size, left to the kernel default when unset
    pub block_size: Option<u32>,
    /// Kernel request timeout in seconds, no timeout when unset
    pub timeout_secs: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            trim_enabled: true,
            flush_enabled: false,
            fua_enabled: false,
            read_only: false,
            block_size: None,
            timeout_secs: None,
        }
    }
}

impl DeviceConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable TRIM
    pub fn no_trim(mut self) -> Self {
        self.trim_enabled = false;
        self
    }

    /// Advertise FLUSH
    pub fn with_flush(mut self) -> Self {
        self.flush_enabled = true;
        self
    }

    /// Advertise FUA, so the kernel can ask for write-through
    pub fn with_fua(mut self) -> Self {
        self.fua_enabled = true;
        self
    }

    /// Make read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set block size
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = Some(size);
        self
    }

    /// Set request timeout
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Flags for `NBD_SET_FLAGS`
    pub fn transmission_flags(&self) -> TransmissionFlags {
        let mut flags = 0;
        if self.trim_enabled {
            flags |= TransmissionFlags::SEND_TRIM;
        }
        if self.flush_enabled {
            flags |= TransmissionFlags::SEND_FLUSH;
        }
        // The kernel only tags writes with FUA when FLUSH is advertised too.
        if self.fua_enabled {
            flags |= TransmissionFlags::SEND_FUA | TransmissionFlags::SEND_FLUSH;
        }
        if self.read_only {
            flags |= TransmissionFlags::READ_ONLY;
        }
        TransmissionFlags::new(flags)
    }

    /// Check values the kernel would reject
    pub fn validate(&self) -> BlockResult<()> {
        if let Some(size) = self.block_size {
            if !size.is_power_of_two() || !(512..=4096).contains(&size) {
                return Err(BlockError::Config(format!(
                    "block_size must be a power of two between 512 and 4096, got {}",
                    size
                )));
            }
        }
        match self.timeout_secs {
            Some(0) => {
                return Err(BlockError::Config("timeout_secs must be non-zero".to_string()))
            }
            Some(secs) if secs > i32::MAX as u64 => {
                return Err(BlockError::Config(format!(
                    "timeout_secs must fit in a C int, got {}",
                    secs
                )))
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse and validate TOML
    pub fn from_toml_str(toml: &str) -> BlockResult<Self> {
        let config: Self =
            toml::from_str(toml).map_err(|e| BlockError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> BlockResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags_advertise_trim_only() {
        let config = DeviceConfig::default();
        assert_eq!(
            config.transmission_flags().bits(),
            TransmissionFlags::SEND_TRIM
        );
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::new()
            .no_trim()
            .with_flush()
            .read_only()
            .block_size(4096)
            .timeout_secs(30);

        let flags = config.transmission_flags();
        assert!(!flags.contains(TransmissionFlags::SEND_TRIM));
        assert!(flags.contains(TransmissionFlags::SEND_FLUSH));
        assert!(flags.contains(TransmissionFlags::READ_ONLY));
        assert!(!flags.contains(TransmissionFlags::SEND_FUA));
        assert_eq!(config.block_size, Some(4096));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fua_advertises_flush() {
        let flags = DeviceConfig::new().no_trim().with_fua().transmission_flags();
        assert_eq!(
            flags.bits(),
            TransmissionFlags::SEND_FUA | TransmissionFlags::SEND_FLUSH
        );

        let config = DeviceConfig::from_toml_str("fua_enabled = true").unwrap();
        assert!(config.fua_enabled);
        assert!(config
            .transmission_flags()
            .contains(TransmissionFlags::SEND_FUA | TransmissionFlags::SEND_TRIM));
    }

    #[test]
    fn test_validate() {
        assert!(DeviceConfig::new().block_size(1000).validate().is_err());
        assert!(DeviceConfig::new().block_size(8192).validate().is_err());
        assert!(DeviceConfig::new().timeout_secs(0).validate().is_err());
        assert!(DeviceConfig::new().timeout_secs(1 << 40).validate().is_err());
        assert!(DeviceConfig::new().timeout_secs(30).validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = DeviceConfig::from_toml_str(
            r#"
            flush_enabled = true
            block_size = 512
            "#,
        )
        .unwrap();

        assert!(config.trim_enabled);
        assert!(config.flush_enabled);
        assert_eq!(config.block_size, Some(512));
        assert_eq!(config.timeout_secs, None);

        assert!(DeviceConfig::from_toml_str("block_size = 3").is_err());
        assert!(DeviceConfig::from_toml_str("trim_enabled = \"yes\"").is_err());
    }
}
