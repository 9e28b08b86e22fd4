// Peers connected to the collaboration channel.
//
// Keyed by presence key (one per connection). The local connection is never
// part of the roster. Selections are compared as sets, so a reordered but
// otherwise identical selection is not reported again.

pub mod color;

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use marginalia_common::model::PresentUser;
use marginalia_common::protocol::broadcast::{affected_annotations, BroadcastMessage};
use marginalia_common::protocol::presence::RosterEntry;
use tracing::{debug, warn};

use crate::events::{Emitter, SubscriptionId};
pub use color::{ColorAllocator, SEABORN_BRIGHT};

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Membership changed; carries the full list of present peers.
    Presence(Vec<PresentUser>),
    /// A peer's selection changed. `None` means it selects nothing.
    SelectionChange { user: PresentUser, selection: Option<Vec<String>> },
}

struct Inner {
    users: Vec<PresentUser>,
    colors: ColorAllocator,
}

pub struct PresenceState {
    local_key: String,
    inner: Mutex<Inner>,
    emitter: Emitter<PresenceEvent>,
}

impl PresenceState {
    pub fn new(local_key: impl Into<String>) -> Self {
        Self::with_colors(local_key, ColorAllocator::new())
    }

    pub fn with_colors(local_key: impl Into<String>, colors: ColorAllocator) -> Self {
        Self {
            local_key: local_key.into(),
            inner: Mutex::new(Inner { users: Vec::new(), colors }),
            emitter: Emitter::new(),
        }
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn subscribe(&self, listener: impl Fn(&PresenceEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.emitter.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    pub fn present_users(&self) -> Vec<PresentUser> {
        self.lock().users.clone()
    }

    pub fn get(&self, presence_key: &str) -> Option<PresentUser> {
        self.lock().users.iter().find(|u| u.presence_key == presence_key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, events: Vec<PresenceEvent>) {
        for event in events {
            self.emitter.emit(&event);
        }
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Reconciles against the channel's authoritative roster.
    ///
    /// Departing peers that held a selection are deselected first. At most
    /// one `Presence` event is emitted, and only if membership changed.
    pub fn sync_users(&self, roster: &[RosterEntry]) {
        let events = {
            let mut inner = self.lock();

            let mut incoming: Vec<&RosterEntry> = Vec::new();
            for entry in roster {
                let is_new_key = !incoming.iter().any(|e| e.presence_key == entry.presence_key);
                if entry.presence_key != self.local_key && is_new_key {
                    incoming.push(entry);
                }
            }

            let (staying, leaving): (Vec<PresentUser>, Vec<PresentUser>) =
                std::mem::take(&mut inner.users)
                    .into_iter()
                    .partition(|u| incoming.iter().any(|e| e.presence_key == u.presence_key));

            let joining: Vec<&RosterEntry> = incoming
                .into_iter()
                .filter(|e| !staying.iter().any(|u| u.presence_key == e.presence_key))
                .collect();

            let mut events: Vec<PresenceEvent> = leaving
                .iter()
                .filter(|u| u.has_selection())
                .map(|u| PresenceEvent::SelectionChange { user: u.clone(), selection: None })
                .collect();

            inner.users = staying;
            for user in &leaving {
                inner.colors.release(&user.color);
            }
            for entry in &joining {
                let color = inner.colors.allocate();
                inner.users.push(PresentUser::new(entry.presence_key.clone(), entry.user.clone(), color));
            }

            if !leaving.is_empty() || !joining.is_empty() {
                debug!(joined = joining.len(), left = leaving.len(), "presence roster changed");
                events.push(PresenceEvent::Presence(inner.users.clone()));
            }
            events
        };

        self.emit_all(events);
    }

    /// Adds a single peer. Already-present keys are ignored.
    pub fn join(&self, entry: RosterEntry) {
        let mut roster: Vec<RosterEntry> = self
            .present_users()
            .into_iter()
            .map(|u| RosterEntry::new(u.presence_key, u.user))
            .collect();
        roster.push(entry);
        self.sync_users(&roster);
    }

    /// Removes a single peer, deselecting it first.
    pub fn leave(&self, presence_key: &str) {
        let roster: Vec<RosterEntry> = self
            .present_users()
            .into_iter()
            .filter(|u| u.presence_key != presence_key)
            .map(|u| RosterEntry::new(u.presence_key, u.user))
            .collect();
        self.sync_users(&roster);
    }

    // ── Selections ─────────────────────────────────────────────────

    /// Sets a peer's selection. Returns `true` if it changed.
    pub fn update_selection(&self, presence_key: &str, selection: Option<Vec<String>>) -> bool {
        let selection = selection.filter(|ids| !ids.is_empty());

        let changed = {
            let mut inner = self.lock();
            let Some(user) = inner.users.iter_mut().find(|u| u.presence_key == presence_key) else {
                warn!(presence_key = %presence_key, "selection update for a peer that is not present");
                return false;
            };
            user.last_active = Utc::now();
            if same_members(user.selection.as_deref(), selection.as_deref()) {
                return false;
            }
            user.selection.clone_from(&selection);
            user.clone()
        };

        self.emitter.emit(&PresenceEvent::SelectionChange { user: changed, selection });
        true
    }

    /// Infers a peer's selection from the annotations it just edited.
    pub fn notify_activity(&self, presence_key: &str, annotation_ids: Vec<String>) -> bool {
        self.update_selection(presence_key, Some(annotation_ids))
    }

    /// Activity inference from an incoming change broadcast.
    pub fn notify_broadcast(&self, message: &BroadcastMessage) -> bool {
        self.notify_activity(&message.from.presence_key, affected_annotations(&message.events))
    }
}

fn same_members(a: Option<&[String]>, b: Option<&[String]>) -> bool {
    let a: HashSet<&str> = a.unwrap_or_default().iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.unwrap_or_default().iter().map(String::as_str).collect();
    a == b
}
