//! Session store and subscribers
//!
//! ```text
//! dispatch(action) ──► reduce ──► new SessionState
//!                                   │
//!                                   ├──► StoragePersistence (device storage)
//!                                   └──► SyncWake (card sync engine)
//! ```
//!
//! Subscribers observe committed state. They never change it.

use super::{reduce, Action, SessionState};
use crate::storage::{self, KeyValueStorage};
use std::sync::Arc;

/// Observer notified after every dispatch
pub trait SessionSubscriber: Send {
    fn on_dispatch(&mut self, action: &Action, state: &SessionState);

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct SessionStore {
    state: SessionState,
    subscribers: Vec<Box<dyn SessionSubscriber>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SessionState) -> Self {
        Self {
            state,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn SessionSubscriber>) {
        tracing::debug!("Session subscriber attached: {}", subscriber.name());
        self.subscribers.push(subscriber);
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn dispatch(&mut self, action: Action) -> &SessionState {
        tracing::trace!("Dispatch {}", action.name());
        let state = std::mem::take(&mut self.state);
        self.state = reduce(state, &action);
        for subscriber in &mut self.subscribers {
            subscriber.on_dispatch(&action, &self.state);
        }
        &self.state
    }
}

/// Mirrors the election definition and shared station state to device storage
pub struct StoragePersistence {
    storage: Arc<dyn KeyValueStorage>,
}

impl StoragePersistence {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }
}

impl SessionSubscriber for StoragePersistence {
    fn on_dispatch(&mut self, action: &Action, state: &SessionState) {
        // Nothing is written until the stored state has been read back
        if !state.initialized_from_storage || !action.touches_stored_state() {
            return;
        }

        let result = match action {
            Action::Unconfigure => self.storage.clear(),
            Action::UpdateElectionDefinition(_) => {
                storage::save_election_definition(
                    self.storage.as_ref(),
                    state.election_definition.as_ref(),
                )
                .and_then(|_| {
                    storage::save_app_state(self.storage.as_ref(), &state.stored_app_state())
                })
            }
            _ => storage::save_app_state(self.storage.as_ref(), &state.stored_app_state()),
        };

        if let Err(e) = result {
            tracing::warn!("Failed to persist station state after {}: {}", action.name(), e);
        }
    }

    fn name(&self) -> &'static str {
        "storage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::{fixture, PrecinctSelection};
    use crate::storage::{load_app_state, load_election_definition, MemoryStorage, StoredAppState};
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl SessionSubscriber for Recorder {
        fn on_dispatch(&mut self, action: &Action, _state: &SessionState) {
            self.0.lock().unwrap().push(action.name());
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    #[test]
    fn test_subscribers_see_every_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut store = SessionStore::new();
        store.subscribe(Box::new(Recorder(Arc::clone(&seen))));

        store.dispatch(Action::TogglePollsOpen);
        let state = store.dispatch(Action::UpdateTally);
        assert_eq!(state.ballots_printed_count, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["togglePollsOpen", "updateTally"]);
    }

    #[test]
    fn test_persistence_waits_for_initialization() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = SessionStore::new();
        store.subscribe(Box::new(StoragePersistence::new(storage.clone())));

        store.dispatch(Action::TogglePollsOpen);
        assert!(storage.keys().is_empty());

        store.dispatch(Action::InitializeAppState {
            election_definition: None,
            stored: StoredAppState::default(),
        });
        assert!(storage.keys().is_empty());

        store.dispatch(Action::UpdateAppPrecinct(PrecinctSelection::single("p1")));
        let stored = load_app_state(storage.as_ref()).unwrap();
        assert_eq!(stored.app_precinct, Some(PrecinctSelection::single("p1")));
    }

    #[test]
    fn test_persistence_writes_definition_and_clears_on_unconfigure() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = SessionStore::new();
        store.subscribe(Box::new(StoragePersistence::new(storage.clone())));
        store.dispatch(Action::InitializeAppState {
            election_definition: None,
            stored: StoredAppState::default(),
        });

        let def = fixture();
        store.dispatch(Action::UpdateElectionDefinition(Box::new(def.clone())));
        assert_eq!(load_election_definition(storage.as_ref()).unwrap(), Some(def));

        store.dispatch(Action::UpdateTally);
        assert_eq!(
            load_app_state(storage.as_ref())
                .unwrap()
                .ballots_printed_count,
            1
        );

        store.dispatch(Action::Unconfigure);
        assert!(storage.keys().is_empty());
    }
}
