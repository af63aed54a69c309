//! # hookcast-settings
//!
//! Configuration for the hookcast relay, loaded from layered sources
//! (in priority order, lowest first):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: an optional JSON file, deep-merged over defaults
//! 3. **Environment variables**: `PORT` and `HOOKCAST_*` overrides
//!
//! The binary applies its CLI flags on top of the loaded value. Settings are
//! passed explicitly to the server at construction; there is no global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::{LoggingSettings, RelaySettings, ServerSettings};
