//! Maestro configuration.
//!
//! The engine is configured entirely through environment variables; config
//! files belong to the out-of-scope transport layer. [`Config::from_env`]
//! reads the recognised variables, [`Config::default`] carries the
//! shipping defaults, and construction happens once in the composition
//! root — components receive the pieces they need by value.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod env;
pub mod types;

pub use env::{ConfigError, EnvSource, ProcessEnv};
pub use types::{Config, HookToggles, RetryDefaults};
