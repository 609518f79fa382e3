use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::core::{Hash32, Key, NULL, Value};
use crate::engine::access::UpdaterArgs;
use crate::engine::graph::{HelperId, Input};
use crate::error::panic_message;
use crate::globals::GlobalSettings;
use crate::store::SettingStore;

pub(crate) type HelperFn = Arc<
    dyn Fn(&UpdaterArgs<'_>, CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

pub(crate) fn helper_fn<F>(compute: F) -> HelperFn
where
    F: Fn(&UpdaterArgs<'_>, CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(compute)
}

/// An asynchronous helper computation the engine has to drive.
pub(crate) struct HelperJob {
    pub helper: HelperId,
    pub generation: u64,
    pub token: CancellationToken,
    pub future: BoxFuture<'static, anyhow::Result<Value>>,
}

/// What a refresh did to a helper.
pub(crate) enum Refresh {
    /// Same input signature as the cached or in-flight computation.
    Unchanged,
    /// A new computation was started and the helper is now pending.
    Started(HelperJob),
    /// The inputs went back to those of the last successful computation,
    /// whose value is current again.
    Restored,
    /// The computation failed before it could start.
    Failed,
}

enum HelperState {
    Idle,
    Pending {
        signature: Hash32,
        generation: u64,
        token: CancellationToken,
        /// The last successful result, kept until the computation resolves.
        previous: Option<(Hash32, Value)>,
    },
    Ready {
        signature: Hash32,
        value: Option<Value>,
    },
}

struct HelperEntry {
    name: Key,
    inputs: Vec<Input>,
    compute: HelperFn,
    state: HelperState,
}

/// Memoizes helper dependencies by their input signature.
///
/// Only the most recent computation for the most recent signature may ever be
/// stored: superseded computations are cancelled through their token, and if
/// they resolve anyway their generation no longer matches.
#[derive(Default)]
pub(crate) struct HelperCache {
    entries: Vec<HelperEntry>,
    generation: u64,
}

impl HelperCache {
    pub(crate) fn register(&mut self, name: Key, inputs: Vec<Input>, compute: HelperFn) -> HelperId {
        self.entries.push(HelperEntry {
            name,
            inputs,
            compute,
            state: HelperState::Idle,
        });
        HelperId(self.entries.len() - 1)
    }

    pub(crate) fn name(&self, id: HelperId) -> &str {
        self.entries.get(id.0).map_or("<unknown helper>", |entry| &entry.name)
    }

    pub(crate) fn value(&self, id: HelperId) -> Option<&Value> {
        match self.entries.get(id.0).map(|entry| &entry.state) {
            Some(HelperState::Ready { value, .. }) => value.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn is_pending(&self, id: HelperId) -> bool {
        matches!(
            self.entries.get(id.0).map(|entry| &entry.state),
            Some(HelperState::Pending { .. })
        )
    }

    pub(crate) fn any_pending(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry.state, HelperState::Pending { .. }))
    }

    fn signature(&self, id: HelperId, store: &SettingStore, globals: &GlobalSettings) -> Hash32 {
        let inputs = &self.entries[id.0].inputs;

        Hash32::of_values(inputs.iter().map(|input| match input {
            Input::Setting(key) => store.value(key).unwrap_or(&NULL),
            Input::Global(key) => globals.get(key),
            Input::Helper(_) | Input::Stored(_) => &NULL,
        }))
    }

    /// Recomputes the input signature and starts a computation if it moved.
    pub(crate) fn refresh(
        &mut self,
        id: HelperId,
        store: &SettingStore,
        globals: &GlobalSettings,
    ) -> Refresh {
        let signature = self.signature(id, store, globals);

        if let HelperState::Ready { signature: s, .. } | HelperState::Pending { signature: s, .. } =
            &self.entries[id.0].state
            && *s == signature
        {
            return Refresh::Unchanged;
        }

        let entry = &mut self.entries[id.0];
        let previous = match std::mem::replace(&mut entry.state, HelperState::Idle) {
            HelperState::Pending { token, previous, .. } => {
                tracing::debug!(helper = %entry.name, "superseding pending computation");
                token.cancel();
                previous
            }
            HelperState::Ready {
                signature,
                value: Some(value),
            } => Some((signature, value)),
            HelperState::Ready { value: None, .. } | HelperState::Idle => None,
        };

        if let Some((cached, value)) = &previous
            && *cached == signature
        {
            tracing::debug!(helper = %entry.name, "inputs match the cached result");
            entry.state = HelperState::Ready {
                signature,
                value: Some(value.clone()),
            };
            return Refresh::Restored;
        }

        let token = CancellationToken::new();
        let started = {
            let entry = &self.entries[id.0];
            let args = UpdaterArgs::new(store, globals, self, &entry.inputs);
            std::panic::catch_unwind(AssertUnwindSafe(|| (entry.compute)(&args, token.clone())))
        };

        let entry = &mut self.entries[id.0];

        match started {
            Ok(future) => {
                self.generation += 1;
                entry.state = HelperState::Pending {
                    signature,
                    generation: self.generation,
                    token: token.clone(),
                    previous,
                };

                Refresh::Started(HelperJob {
                    helper: id,
                    generation: self.generation,
                    token,
                    future,
                })
            }
            Err(panic) => {
                tracing::warn!(
                    helper = %entry.name,
                    "helper dependency panicked: {}",
                    panic_message(panic)
                );
                entry.state = HelperState::Ready {
                    signature,
                    value: None,
                };
                Refresh::Failed
            }
        }
    }

    /// Stores the outcome of a computation if it is still the current one.
    /// `None` means the computation was cancelled before it resolved.
    pub(crate) fn resolve(
        &mut self,
        id: HelperId,
        generation: u64,
        result: Option<anyhow::Result<Value>>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(id.0) else {
            return false;
        };

        let signature = match &entry.state {
            HelperState::Pending {
                signature,
                generation: current,
                ..
            } if *current == generation => *signature,
            _ => {
                tracing::debug!(helper = %entry.name, generation, "ignoring stale helper result");
                return false;
            }
        };

        let value = match result {
            Some(Ok(value)) => Some(value),
            Some(Err(err)) => {
                tracing::warn!(helper = %entry.name, "helper dependency failed: {err:#}");
                None
            }
            None => None,
        };

        entry.state = HelperState::Ready { signature, value };
        true
    }

    /// Cancels every pending computation, e.g. when the owning node goes away.
    pub(crate) fn cancel_all(&mut self) {
        for entry in &mut self.entries {
            if let HelperState::Pending { token, .. } = &entry.state {
                token.cancel();
                entry.state = HelperState::Idle;
            }
        }
    }
}
