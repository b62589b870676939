use serde::Deserialize;
use std::path::Path;

/// Device-wide settings, usually read from the `[device]` table of a TOML file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    /// Enable `VK_LAYER_KHRONOS_validation` plus the debug messenger.
    pub validation: bool,
    /// Sets the first descriptor pool of every uniform layout may hold.
    pub descriptor_pool_initial_size: u32,
    /// Each new pool is this many times larger than the last.
    pub descriptor_pool_growth_factor: u32,
    pub frames_in_flight: u32,
    pub min_image_count: u32,
    pub depth_buffer: bool,
    pub vsync: bool,
    pub prefer_mailbox: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "ember".to_owned(),
            validation: cfg!(debug_assertions),
            descriptor_pool_initial_size: 16,
            descriptor_pool_growth_factor: 2,
            frames_in_flight: 2,
            min_image_count: 2,
            depth_buffer: true,
            vsync: true,
            prefer_mailbox: true,
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<DeviceConfig>(s).map(DeviceConfig::validated)
    }

    /// Reads `path`; a missing or unreadable file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(s) => match Self::from_toml_str(&s) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("{}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Applies `EMBER_VALIDATION` and `EMBER_VSYNC` (`0`/`1`) on top.
    pub fn apply_env(mut self) -> Self {
        if let Some(on) = env_flag("EMBER_VALIDATION") {
            self.validation = on;
        }
        if let Some(on) = env_flag("EMBER_VSYNC") {
            self.vsync = on;
        }
        self
    }

    pub fn validated(mut self) -> Self {
        self.descriptor_pool_initial_size = self.descriptor_pool_initial_size.max(1);
        self.descriptor_pool_growth_factor = self.descriptor_pool_growth_factor.max(2);
        self.frames_in_flight = self.frames_in_flight.clamp(1, 4);
        self.min_image_count = self.min_image_count.max(2);
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok().as_deref() {
        Some("1") => Some(true),
        Some("0") => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = DeviceConfig::from_toml_str(
            r#"
            app_name = "demo"
            descriptor_pool_initial_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.app_name, "demo");
        assert_eq!(cfg.descriptor_pool_initial_size, 4);
        assert_eq!(cfg.descriptor_pool_growth_factor, 2);
        assert!(cfg.vsync);
    }

    #[test]
    fn nonsense_values_are_clamped() {
        let cfg = DeviceConfig::from_toml_str(
            r#"
            descriptor_pool_initial_size = 0
            descriptor_pool_growth_factor = 1
            frames_in_flight = 9
            min_image_count = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.descriptor_pool_initial_size, 1);
        assert_eq!(cfg.descriptor_pool_growth_factor, 2);
        assert_eq!(cfg.frames_in_flight, 4);
        assert_eq!(cfg.min_image_count, 2);
    }

    #[test]
    fn bad_types_are_rejected() {
        assert!(DeviceConfig::from_toml_str("vsync = \"sometimes\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = DeviceConfig::load("/definitely/not/here/ember.toml");
        assert_eq!(cfg, DeviceConfig::default());
    }
}
