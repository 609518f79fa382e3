use thiserror::Error;

use crate::core::{Key, NodeId, Value};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown provider kind '{0}'")]
    UnknownProviderKind(Key),

    #[error("Unknown group kind '{0}'")]
    UnknownGroupKind(Key),

    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Node {0} is not a group")]
    NotAGroup(NodeId),

    #[error("Node {0} is not a data provider")]
    NotAProvider(NodeId),

    #[error("Setting '{key}' is not declared by node {node}")]
    UnknownSetting { node: NodeId, key: Key },

    #[error("Setting '{key}' of node {node} is controlled by group {group}")]
    SettingOverridden { node: NodeId, key: Key, group: NodeId },

    #[error("Value {value} is not allowed for setting '{key}'")]
    ValueNotAllowed { key: Key, value: Value },

    #[error("The root group can't be removed or moved")]
    RootNode,

    #[error("Node {0} can't be moved into its own subtree")]
    InvalidMove(NodeId),

    #[error("Invalid dependency declaration.\n{0}")]
    Dependency(#[from] DependencyError),

    #[error("Couldn't encode or decode engine state.\n{0}")]
    State(#[from] serde_json::Error),

    #[error("No async runtime available for provider work.\n{0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

/// Construction-time defects in the dependencies a provider kind declares.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Provider '{kind}': dependency cycle through {vertex}")]
    Cycle { kind: Key, vertex: String },

    #[error("Provider '{kind}': '{key}' is not a declared setting")]
    UnknownSetting { kind: Key, key: Key },

    #[error("Provider '{kind}': stored data '{key}' has no updater")]
    UnknownStoredData { kind: Key, key: Key },

    #[error("Provider '{kind}': {target} already has an updater")]
    DuplicateUpdater { kind: Key, target: String },

    #[error("Provider '{kind}': helper '{name}' may only read settings and globals")]
    HelperInput { kind: Key, name: Key },

    #[error("Provider '{kind}': {target} reads a helper that was never declared")]
    UnknownHelper { kind: Key, target: String },
}

/// Contract violations raised while a provider fetches its data. They end up
/// as the provider's `ERROR` status, never as a crash.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Stored data '{0}' is missing")]
    MissingStoredData(Key),

    #[error("Fetch task panicked: {0}")]
    Panicked(String),
}

/// Converts a caught panic payload into a readable message.
pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
