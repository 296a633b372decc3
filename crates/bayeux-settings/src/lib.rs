//! # bayeux-settings
//!
//! Layered configuration for the Bayeux server.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`BayeuxSettings::default()`]
//! 2. **Settings file**: `~/.bayeux/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment variables**: `BAYEUX_*` overrides
//!
//! ```no_run
//! let settings = bayeux_settings::load_settings().unwrap_or_default();
//! println!("long-poll timeout: {:?}", settings.transport.timeout());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{BayeuxSettings, LoggingSettings, ServerSettings, TransportSettings};
