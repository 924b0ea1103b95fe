//! Infrastructure: configuration, logging, and provider wrappers.

pub mod config;
pub mod logging;
pub mod providers;
