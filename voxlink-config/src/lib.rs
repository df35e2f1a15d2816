//! Configuration management for voxlink components

use serde::Deserialize;
use std::env;

/// Audio engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Wire id of the profile to use when a call starts unprompted
    pub default_profile_id: u8,
    /// Capacity of the playback PCM ring, in frames
    pub max_buffer_frames: usize,
    /// Log level for the control path
    pub log_level: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            default_profile_id: 0x40, // medium quality
            max_buffer_frames: 50,
            log_level: Some("info".to_string()),
        }
    }
}

impl EngineSettings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = EngineSettings::default();

        let default_profile_id = match env::var("VOXLINK_PROFILE") {
            Ok(raw) => parse_profile_id(&raw).map_err(config::ConfigError::Message)?,
            Err(_) => defaults.default_profile_id,
        };

        let max_buffer_frames = match env::var("VOXLINK_MAX_BUFFER_FRAMES") {
            Ok(raw) => raw
                .parse::<usize>()
                .map_err(|e| config::ConfigError::Message(format!(
                    "VOXLINK_MAX_BUFFER_FRAMES: {e}"
                )))?,
            Err(_) => defaults.max_buffer_frames,
        };

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .or(defaults.log_level);

        Ok(EngineSettings {
            default_profile_id,
            max_buffer_frames,
            log_level,
        })
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Parse a profile id given either as decimal or as `0x`-prefixed hex
fn parse_profile_id(raw: &str) -> Result<u8, String> {
    let trimmed = raw.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        trimmed.parse::<u8>()
    };
    parsed.map_err(|e| format!("VOXLINK_PROFILE '{raw}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.default_profile_id, 0x40);
        assert_eq!(settings.max_buffer_frames, 50);
        assert_eq!(settings.log_level(), "info");
    }

    #[test]
    fn test_parse_profile_id_hex_and_decimal() {
        assert_eq!(parse_profile_id("0x70").unwrap(), 0x70);
        assert_eq!(parse_profile_id("64").unwrap(), 64);
        assert!(parse_profile_id("zz").is_err());
    }
}
