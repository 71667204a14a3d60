//! # streamhub-settings
//!
//! Layered configuration for the streamhub server.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`HubSettings::default()`]
//! 2. **Settings file**: `~/.streamhub/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `STREAMHUB_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = HubSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = HubSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8765);
        assert!((settings.protocol.default_poll_interval_secs - 5.0).abs() < f64::EPSILON);
        assert!((settings.protocol.min_poll_interval_secs - 1.0).abs() < f64::EPSILON);
        assert_eq!(settings.heartbeat.timeout_secs, 60);
    }
}
