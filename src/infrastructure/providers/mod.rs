//! Provider implementations and the name registry.

pub mod cli;
pub mod registry;
pub mod scripted;

pub use cli::{CliProvider, CliProviderConfig};
pub use registry::ProviderRegistry;
pub use scripted::ScriptedProvider;
