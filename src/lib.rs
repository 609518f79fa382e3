#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod assembler;
mod blueprint;
mod core;
mod engine;
mod error;
mod globals;
mod persist;
mod provider;
mod setting;
mod store;

pub use crate::assembler::{
    Assembler, BoundingBox, GroupArgs, GroupProduct, GroupTransforms, ProductNode, ProviderError,
    ProviderProduct, ProviderTransforms, TransformArgs, VisualizationProduct, VisualizationTargets,
};
pub use crate::blueprint::Blueprint;
pub use crate::core::{Key, NodeId, Payload, Settings, Value, settings};
pub use crate::engine::{
    Dependencies, Diagnostics, Engine, FetchContext, FetchStatus, HelperId, Input, SettingsAccess,
    UpdaterArgs,
};
pub use crate::error::*;
pub use crate::globals::GlobalSettings;
pub use crate::provider::{DataProvider, GroupDefinition, ROOT_KIND};
pub use crate::setting::{Constraint, SettingAttributes, SettingState};

/// Installs a `tracing` subscriber printing to stderr, filtered through
/// `RUST_LOG` (default `info`).
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))?;

    Ok(())
}
