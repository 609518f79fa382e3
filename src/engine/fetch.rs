//! Per-provider fetch orchestration.
//!
//! ```text
//!            ┌──────────────── settings changed ───────────────┐
//!            v                                                 │
//!   IDLE ─> LOADING ─┬─> SUCCESS ──────────────────────────────┤
//!                    ├─> ERROR ────────────────────────────────┤
//!   (invalid) ───────┴─> INVALID_SETTINGS ─────────────────────┘
//! ```
//!
//! Every attempt gets a generation number. A completion is applied only if it
//! belongs to the attempt that is still current, so a late answer for
//! superseded settings can never overwrite newer data.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{Key, NULL, Payload, Settings, Value};
use crate::engine::access::SettingsAccess;
use crate::error::{FetchError, panic_message};
use crate::globals::GlobalSettings;
use crate::provider::DataProvider;
use crate::store::SettingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Idle,
    Loading,
    Success,
    Error,
    InvalidSettings,
}

impl Display for FetchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FetchStatus::Idle => "IDLE",
            FetchStatus::Loading => "LOADING",
            FetchStatus::Success => "SUCCESS",
            FetchStatus::Error => "ERROR",
            FetchStatus::InvalidSettings => "INVALID_SETTINGS",
        })
    }
}

type Queries = Arc<Mutex<BTreeMap<Key, CancellationToken>>>;

/// Everything a provider's fetch may read, snapshotted when the attempt
/// starts.
pub struct FetchContext {
    settings: Settings,
    stored: BTreeMap<Key, Value>,
    globals: Settings,
    token: CancellationToken,
    queries: Queries,
}

impl FetchContext {
    pub fn setting(&self, key: &str) -> &Value {
        self.settings.get(key).unwrap_or(&NULL)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn global(&self, key: &str) -> &Value {
        self.globals.get(key).unwrap_or(&NULL)
    }

    /// A stored-data entry the fetch relies on. Missing data is a contract
    /// violation and ends the attempt in `ERROR`.
    pub fn stored(&self, key: &str) -> Result<&Value, FetchError> {
        self.stored
            .get(key)
            .ok_or_else(|| FetchError::MissingStoredData(key.into()))
    }

    /// Fires when this attempt is superseded or its node is removed.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Registers a cancellation handle for one underlying query. The handle
    /// is cancelled before the next attempt starts.
    pub fn register_query(&self, key: impl Into<Key>) -> CancellationToken {
        let token = self.token.child_token();
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), token.clone());
        token
    }
}

/// A started fetch the engine has to drive.
pub(crate) struct FetchJob {
    pub generation: u64,
    pub token: CancellationToken,
    pub future: BoxFuture<'static, anyhow::Result<Payload>>,
}

struct Attempt {
    generation: u64,
    token: CancellationToken,
    queries: Queries,
}

impl Attempt {
    fn cancel(self) {
        let queries = std::mem::take(&mut *self.queries.lock().unwrap_or_else(PoisonError::into_inner));
        for token in queries.into_values() {
            token.cancel();
        }
        self.token.cancel();
    }
}

#[derive(Clone, PartialEq)]
struct Snapshot {
    settings: Settings,
    stored: BTreeMap<Key, Value>,
}

pub(crate) struct FetchState {
    status: FetchStatus,
    generation: u64,
    attempt: Option<Attempt>,
    last_fetch: Option<Snapshot>,
    data: Option<Payload>,
    error: Option<String>,
    suspended: bool,
}

impl Default for FetchState {
    fn default() -> Self {
        Self {
            status: FetchStatus::Idle,
            generation: 0,
            attempt: None,
            last_fetch: None,
            data: None,
            error: None,
            suspended: false,
        }
    }
}

impl FetchState {
    /// The status as reported: a suspended provider is always `IDLE`.
    pub(crate) fn status(&self) -> FetchStatus {
        if self.suspended {
            FetchStatus::Idle
        } else {
            self.status
        }
    }

    pub(crate) fn data(&self) -> Option<&Payload> {
        self.data.as_ref()
    }

    pub(crate) fn error(&self) -> Option<&str> {
        match self.status() {
            FetchStatus::Error => self.error.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub(crate) fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// Keys of the queries registered by the current attempt.
    pub(crate) fn active_queries(&self) -> Vec<Key> {
        match &self.attempt {
            Some(attempt) => attempt
                .queries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Decides whether the provider has to fetch again and starts the attempt.
    pub(crate) fn update(
        &mut self,
        provider: &dyn DataProvider,
        store: &SettingStore,
        globals: &GlobalSettings,
    ) -> Option<FetchJob> {
        let next = Snapshot {
            settings: store.snapshot(),
            stored: store.stored_snapshot(),
        };

        let required = match &self.last_fetch {
            None => true,
            Some(prev) => {
                provider.settings_require_refetch(&prev.settings, &next.settings)
                    || prev.stored != next.stored
            }
        };

        if !required {
            return None;
        }

        if self.suspended {
            // Re-evaluated once the pending metadata arrives.
            if let Some(attempt) = self.attempt.take() {
                tracing::debug!("cancelling fetch while waiting on metadata");
                attempt.cancel();
                self.status = FetchStatus::Idle;
                self.last_fetch = None;
            }
            return None;
        }

        self.cancel();

        let valid = {
            let access = SettingsAccess { store, globals };
            std::panic::catch_unwind(AssertUnwindSafe(|| provider.are_settings_valid(&access)))
                .unwrap_or(false)
        };

        if !valid {
            self.status = FetchStatus::InvalidSettings;
            self.error = None;
            self.last_fetch = Some(next);
            return None;
        }

        let token = CancellationToken::new();
        let queries = Queries::default();
        let context = FetchContext {
            settings: next.settings.clone(),
            stored: next.stored.clone(),
            globals: globals.snapshot(),
            token: token.clone(),
            queries: queries.clone(),
        };

        self.last_fetch = Some(next);

        match std::panic::catch_unwind(AssertUnwindSafe(|| provider.fetch_data(context))) {
            Ok(future) => {
                self.generation += 1;
                self.status = FetchStatus::Loading;
                self.error = None;
                self.attempt = Some(Attempt {
                    generation: self.generation,
                    token: token.clone(),
                    queries,
                });

                Some(FetchJob {
                    generation: self.generation,
                    token,
                    future,
                })
            }
            Err(panic) => {
                let err = FetchError::Panicked(panic_message(panic));
                tracing::warn!("fetch failed: {err}");
                self.status = FetchStatus::Error;
                self.error = Some(err.to_string());
                None
            }
        }
    }

    /// Applies the outcome of attempt `generation`, returning whether it was
    /// still current. `None` means the attempt was cancelled.
    pub(crate) fn complete(
        &mut self,
        generation: u64,
        result: Option<anyhow::Result<Payload>>,
    ) -> bool {
        match &self.attempt {
            Some(attempt) if attempt.generation == generation => {}
            _ => {
                tracing::debug!(generation, "ignoring stale fetch completion");
                return false;
            }
        }

        // Fulfilled: the handles are released without being cancelled.
        if let Some(attempt) = self.attempt.take() {
            attempt.queries.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }

        match result {
            Some(Ok(payload)) => {
                tracing::info!(generation, "fetch succeeded");
                self.data = Some(payload);
                self.status = FetchStatus::Success;
                self.error = None;
            }
            Some(Err(err)) => {
                tracing::warn!(generation, "fetch failed: {err:#}");
                self.status = FetchStatus::Error;
                self.error = Some(format!("{err:#}"));
            }
            None => {
                self.status = FetchStatus::Idle;
                self.last_fetch = None;
            }
        }

        true
    }

    /// Cancels the in-flight attempt, if any.
    pub(crate) fn cancel(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            tracing::debug!(generation = attempt.generation, "cancelling fetch");
            attempt.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::settings;
    use crate::setting::Constraint;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl DataProvider for Counting {
        fn settings(&self) -> Vec<Key> {
            vec!["A".into(), "B".into()]
        }

        fn default_name(&self) -> String {
            "counting".into()
        }

        fn fetch_data(&self, ctx: FetchContext) -> BoxFuture<'static, anyhow::Result<Payload>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.register_query("surface");
            let a = ctx.setting("A").clone();
            async move { Ok(Arc::new(a) as Payload) }.boxed()
        }
    }

    fn provider() -> Counting {
        Counting {
            calls: AtomicUsize::new(0),
        }
    }

    fn store(a: &str) -> SettingStore {
        SettingStore::new(vec!["A".into(), "B".into()], &settings([("A", a), ("B", "x")]))
    }

    fn payload(value: &str) -> Payload {
        Arc::new(json!(value))
    }

    #[test]
    fn test_same_settings_do_not_refetch() {
        let provider = provider();
        let globals = GlobalSettings::default();
        let mut state = FetchState::default();

        let job = state.update(&provider, &store("1"), &globals).unwrap();
        assert_eq!(state.status(), FetchStatus::Loading);
        assert!(state.complete(job.generation, Some(Ok(payload("1")))));
        assert_eq!(state.status(), FetchStatus::Success);

        assert!(state.update(&provider, &store("1"), &globals).is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_completion_is_discarded() {
        let provider = provider();
        let globals = GlobalSettings::default();
        let mut state = FetchState::default();

        let first = state.update(&provider, &store("1"), &globals).unwrap();
        let second = state.update(&provider, &store("2"), &globals).unwrap();
        assert!(first.token.is_cancelled());

        assert!(state.complete(second.generation, Some(Ok(payload("2")))));
        assert!(!state.complete(first.generation, Some(Ok(payload("1")))));

        let data = state.data().unwrap().clone().downcast::<Value>().unwrap();
        assert_eq!(*data, json!("2"));
    }

    #[test]
    fn test_queries_released_before_next_attempt() {
        let provider = provider();
        let globals = GlobalSettings::default();
        let mut state = FetchState::default();

        state.update(&provider, &store("1"), &globals).unwrap();
        assert_eq!(state.active_queries(), vec![Key::from("surface")]);

        let first_query = state
            .attempt
            .as_ref()
            .map(|attempt| attempt.queries.lock().unwrap()["surface"].clone())
            .unwrap();

        state.update(&provider, &store("2"), &globals).unwrap();
        assert!(first_query.is_cancelled());
    }

    #[test]
    fn test_invalid_settings_never_fetch() {
        let provider = provider();
        let globals = GlobalSettings::default();
        let mut state = FetchState::default();

        let mut store = store("1");
        store.apply_constraint("B", Constraint::empty());

        assert!(state.update(&provider, &store, &globals).is_none());
        assert_eq!(state.status(), FetchStatus::InvalidSettings);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_keeps_previous_payload() {
        let provider = provider();
        let globals = GlobalSettings::default();
        let mut state = FetchState::default();

        let job = state.update(&provider, &store("1"), &globals).unwrap();
        state.complete(job.generation, Some(Ok(payload("1"))));

        let job = state.update(&provider, &store("2"), &globals).unwrap();
        state.complete(job.generation, Some(Err(anyhow::anyhow!("backend down"))));

        assert_eq!(state.status(), FetchStatus::Error);
        assert_eq!(state.error(), Some("backend down"));
        assert!(state.data().is_some());
    }

    #[test]
    fn test_suspended_reports_idle_and_defers() {
        let provider = provider();
        let globals = GlobalSettings::default();
        let mut state = FetchState::default();

        let job = state.update(&provider, &store("1"), &globals).unwrap();
        state.set_suspended(true);
        assert_eq!(state.status(), FetchStatus::Idle);

        assert!(state.update(&provider, &store("2"), &globals).is_none());
        assert!(job.token.is_cancelled());
        assert!(state.active_queries().is_empty());

        state.set_suspended(false);
        assert!(state.update(&provider, &store("2"), &globals).is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refetch_idempotence() {
        let provider = provider();
        let snapshot = store("1").snapshot();
        assert!(!provider.settings_require_refetch(&snapshot, &snapshot));
    }
}
