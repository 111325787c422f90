//! Configuration Module
//!
//! Configuration loading for the quote stream binaries.

mod settings;

pub use settings::{
    ConfigError, DataFeed, Environment, ServerSettings, SessionSettings, StreamConfig,
};
