// Hovered annotation id, cleared when the annotation is deleted.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::events::{Emitter, SubscriptionId};
use crate::store::{ObserveOptions, ObserverId, Store};

pub struct Hover {
    store: Arc<Store>,
    current: Mutex<Option<String>>,
    emitter: Emitter<Option<String>>,
    observer: Mutex<Option<ObserverId>>,
}

impl Hover {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let hover = Arc::new(Self {
            store: Arc::clone(&store),
            current: Mutex::new(None),
            emitter: Emitter::new(),
            observer: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&hover);
        let id = store.observe(
            move |event| {
                let Some(hover) = weak.upgrade() else { return };
                let Some(hovered) = hover.get() else { return };
                if event.changes.deleted.iter().any(|a| a.id == hovered) {
                    hover.set(None);
                }
            },
            ObserveOptions::default(),
        );
        *hover.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

        hover
    }

    pub fn get(&self) -> Option<String> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, id: Option<String>) {
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == id {
                return;
            }
            current.clone_from(&id);
        }
        self.emitter.emit(&id);
    }

    pub fn subscribe(&self, listener: impl Fn(&Option<String>) + Send + Sync + 'static) -> SubscriptionId {
        self.emitter.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    pub fn detach(&self) {
        if let Some(id) = self.observer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.store.unobserve(id);
        }
    }
}
