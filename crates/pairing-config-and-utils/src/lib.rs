//! Configuration, filesystem paths and logging setup shared by the
//! channel pairing crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, PairingSettings, DEFAULT_CALLBACK_BASE_URL, DEFAULT_EVENT_TYPES, DEFAULT_LOG_LEVEL,
    DEFAULT_PROVIDER_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, LogFormat};
pub use paths::{Paths, BASE_DIR_ENV};
