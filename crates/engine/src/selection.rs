// Selected annotation ids, pruned automatically when the store deletes them.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use marginalia_common::model::AnnotationKey;

use crate::events::{Emitter, SubscriptionId};
use crate::store::{ObserveOptions, ObserverId, Store};

/// What caused a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pointer,
    Keyboard,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: InputKind,
    pub at: DateTime<Utc>,
}

impl InputEvent {
    pub fn now(kind: InputKind) -> Self {
        Self { kind, at: Utc::now() }
    }
}

/// Ordered selected ids plus the input that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectionState {
    pub selected: Vec<String>,
    pub event: Option<InputEvent>,
}

impl SelectionState {
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

pub struct Selection {
    store: Arc<Store>,
    state: Mutex<SelectionState>,
    emitter: Emitter<SelectionState>,
    observer: Mutex<Option<ObserverId>>,
}

impl Selection {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let selection = Arc::new(Self {
            store: Arc::clone(&store),
            state: Mutex::new(SelectionState::default()),
            emitter: Emitter::new(),
            observer: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&selection);
        let id = store.observe(
            move |event| {
                if let Some(selection) = weak.upgrade() {
                    let deleted: Vec<&str> =
                        event.changes.deleted.iter().map(|a| a.id.as_str()).collect();
                    selection.remove_from_selection(&deleted);
                }
            },
            ObserveOptions::default(),
        );
        *selection.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

        selection
    }

    pub fn set_selected<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(SelectionState { selected: ids.into_iter().map(Into::into).collect(), event: None });
    }

    pub fn select_with_event<I, S>(&self, ids: I, event: InputEvent)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(SelectionState {
            selected: ids.into_iter().map(Into::into).collect(),
            event: Some(event),
        });
    }

    pub fn clear(&self) {
        self.set(SelectionState::default());
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_selected<K: AnnotationKey + ?Sized>(&self, key: &K) -> bool {
        let id = key.annotation_id();
        self.lock().selected.iter().any(|selected| selected == id)
    }

    pub fn selected(&self) -> Vec<String> {
        self.lock().selected.clone()
    }

    pub fn current(&self) -> SelectionState {
        self.lock().clone()
    }

    pub fn subscribe(&self, listener: impl Fn(&SelectionState) + Send + Sync + 'static) -> SubscriptionId {
        self.emitter.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    /// Stops pruning on store deletions.
    pub fn detach(&self) {
        if let Some(id) = self.observer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.store.unobserve(id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SelectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, next: SelectionState) {
        {
            let mut state = self.lock();
            if *state == next {
                return;
            }
            *state = next.clone();
        }
        self.emitter.emit(&next);
    }

    fn remove_from_selection(&self, ids: &[&str]) {
        let next = {
            let state = self.lock();
            if !state.selected.iter().any(|id| ids.contains(&id.as_str())) {
                return;
            }
            let selected: Vec<String> =
                state.selected.iter().filter(|id| !ids.contains(&id.as_str())).cloned().collect();
            let event = if selected.is_empty() { None } else { state.event.clone() };
            SelectionState { selected, event }
        };
        self.set(next);
    }
}
