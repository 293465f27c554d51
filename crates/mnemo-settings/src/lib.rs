//! # mnemo-settings
//!
//! Configuration for Mnemo sessions, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MnemoSettings::default()`]
//! 2. **User file**: `~/.mnemo/settings.json` or `$MNEMO_SETTINGS` (deep-merged over defaults)
//! 3. **Environment variables**: `MNEMO_*` overrides (highest priority)
//!
//! There is no process-wide settings instance: callers load once and pass
//! the value (or the pieces they need) to whatever they construct.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{EnvOverrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
