// Synchronization engine: keeps one store in step with its peers and the
// backing store.
//
// Data paths:
//   local store change  -> marshal -> peer broadcast
//   lifecycle event     -> APPLY_LOCAL -> write queue -> backing store
//   peer broadcast      -> apply (REMOTE)
//   change feed row     -> reconcile (REMOTE, strict version arbitration)
//   roster / selection  -> presence
//
// `connect` joins the channel and subscribes to the change feed before
// fetching the snapshot, so nothing committed in between is lost; buffered
// rows the snapshot already contains are discarded as stale. Broadcasts that
// arrived during the load are replayed before the loops start, minus
// creations of annotations the snapshot already holds.

pub mod apply;
pub mod backing;
pub mod channel;
pub mod error;
pub mod marshal;
pub mod memory;
pub mod postgres;
pub mod reconcile;
pub mod relay;
pub mod retry;
pub mod sender;
pub mod ws;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use marginalia_common::model::{Annotation, Origin, User};
use marginalia_common::protocol::broadcast::{BroadcastEvent, BroadcastMessage, Sender};
use marginalia_common::protocol::cdc::CdcMessage;
use marginalia_common::protocol::presence::{RosterEntry, SelectionBroadcast};
use marginalia_common::protocol::records::{parse_annotation_record, AnnotationRecord};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{Emitter, SubscriptionId};
use crate::lifecycle::Lifecycle;
use crate::presence::PresenceState;
use crate::selection::Selection;
use crate::store::{ObserveOptions, ObserverId, Store};

pub use apply::{apply_broadcast, ApplyOutcome};
pub use backing::{BackingStore, BackingStoreError, ChangeFeed};
pub use channel::{ChannelError, ChannelMessage, Inbox, LocalChannel, LocalHub, RealtimeChannel};
pub use error::{IntegrityError, SaveError, SyncError};
pub use marshal::{marshal, BroadcastPolicy};
pub use memory::InMemoryBackingStore;
pub use reconcile::{reconcile, CdcOutcome};
pub use relay::RelayState;
pub use retry::RetryPolicy;
pub use sender::{apply_local, WriteOp};
pub use ws::WsChannel;

// ── Public types ───────────────────────────────────────────────────

/// Who this engine is on the channel. One presence key per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub presence_key: String,
    pub user: User,
}

impl PeerIdentity {
    /// Fresh random presence key for `user`.
    pub fn new(user: User) -> Self {
        Self { presence_key: Uuid::new_v4().to_string(), user }
    }

    pub fn with_key(presence_key: impl Into<String>, user: User) -> Self {
        Self { presence_key: presence_key.into(), user }
    }

    pub fn sender(&self) -> Sender {
        Sender::new(self.presence_key.clone(), self.user.id())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Snapshot loaded into the store.
    InitialLoad(Vec<Annotation>),
    InitialLoadError(BackingStoreError),
    SaveError(SaveError),
    IntegrityError(IntegrityError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub broadcast_bodies: bool,
    /// Outgoing broadcast rate limit; 0 disables throttling.
    pub events_per_second: u32,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { broadcast_bodies: false, events_per_second: 30, retry: RetryPolicy::default() }
    }
}

// ── Engine ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    ShutDown,
}

#[derive(Default)]
struct Hooks {
    lifecycle: Option<SubscriptionId>,
    store: Option<ObserverId>,
    selection: Option<SubscriptionId>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SyncEngine<B, C> {
    identity: PeerIdentity,
    store: Arc<Store>,
    selection: Arc<Selection>,
    lifecycle: Arc<Lifecycle>,
    backing: Arc<B>,
    channel: Arc<C>,
    options: SyncOptions,
    presence: Arc<PresenceState>,
    events: Arc<Emitter<SyncEvent>>,
    phase: Mutex<Phase>,
    hooks: Mutex<Hooks>,
    running: Mutex<Option<Running>>,
}

impl<B: BackingStore, C: RealtimeChannel> SyncEngine<B, C> {
    pub fn new(
        identity: PeerIdentity,
        store: Arc<Store>,
        selection: Arc<Selection>,
        lifecycle: Arc<Lifecycle>,
        backing: Arc<B>,
        channel: Arc<C>,
        options: SyncOptions,
    ) -> Self {
        let presence = Arc::new(PresenceState::new(identity.presence_key.clone()));
        Self {
            identity,
            store,
            selection,
            lifecycle,
            backing,
            channel,
            options,
            presence,
            events: Arc::new(Emitter::new()),
            phase: Mutex::new(Phase::Idle),
            hooks: Mutex::new(Hooks::default()),
            running: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceState> {
        &self.presence
    }

    /// `SyncEvent` signals: initial load, save failures, integrity errors.
    pub fn events(&self) -> &Emitter<SyncEvent> {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        *self.lock_phase() == Phase::Connected
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Connect ────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), SyncError> {
        {
            let mut phase = self.lock_phase();
            match *phase {
                Phase::Connecting | Phase::Connected => return Err(SyncError::AlreadyConnected),
                Phase::ShutDown => return Err(SyncError::ShutDown),
                Phase::Idle => *phase = Phase::Connecting,
            }
        }

        match self.establish().await {
            Ok(running) => {
                // A shutdown may have raced the connect.
                let raced = {
                    let mut phase = self.lock_phase();
                    let raced = *phase == Phase::ShutDown;
                    if !raced {
                        *phase = Phase::Connected;
                    }
                    raced
                };
                if raced {
                    self.detach_hooks();
                    running.shutdown.send_replace(true);
                    self.leave_quietly(&self.identity.presence_key).await;
                    return Err(SyncError::ShutDown);
                }
                *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(running);
                info!(presence_key = %self.identity.presence_key, user = %self.identity.user.id(), "sync engine connected");
                Ok(())
            }
            Err(err) => {
                {
                    let mut phase = self.lock_phase();
                    if *phase == Phase::Connecting {
                        *phase = Phase::Idle;
                    }
                }
                Err(err)
            }
        }
    }

    async fn establish(&self) -> Result<Running, SyncError> {
        let key = self.identity.presence_key.clone();
        let mut inbox = self
            .channel
            .join(RosterEntry::new(key.clone(), self.identity.user.clone()))
            .await?;

        let feed = match self.backing.subscribe_changes().await {
            Ok(feed) => feed,
            Err(err) => {
                self.leave_quietly(&key).await;
                return Err(SyncError::ChangeFeed(err));
            }
        };

        let records = match self.backing.fetch_all().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "initial load failed");
                self.events.emit(&SyncEvent::InitialLoadError(err.clone()));
                self.leave_quietly(&key).await;
                return Err(SyncError::InitialLoad(err));
            }
        };
        let snapshot = self.load_snapshot(&records);

        let inbound = Inbound {
            store: Arc::clone(&self.store),
            presence: Arc::clone(&self.presence),
            events: Arc::clone(&self.events),
        };
        inbound.catch_up(&mut inbox, &snapshot);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (change_tx, change_rx) = mpsc::unbounded_channel::<Vec<BroadcastEvent>>();
        let (selection_tx, selection_rx) = mpsc::unbounded_channel::<SelectionBroadcast>();

        // Writer runs detached: an in-flight write is allowed to finish.
        let writer = sender::Writer {
            backing: Arc::clone(&self.backing),
            actor: self.identity.user.clone(),
            retry: self.options.retry.clone(),
            events: Arc::clone(&self.events),
            shutdown: shutdown_rx.clone(),
        };
        tokio::spawn(writer.run(write_rx));

        self.install_hooks(write_tx, change_tx, selection_tx);

        let outbound = tokio::spawn(run_outbound(
            Arc::clone(&self.channel),
            self.identity.sender(),
            change_rx,
            selection_rx,
            self.options.events_per_second,
            shutdown_rx.clone(),
        ));

        let inbound = tokio::spawn(inbound.run(inbox, feed, shutdown_rx));

        Ok(Running { shutdown, tasks: vec![inbound, outbound] })
    }

    /// Replaces the store contents and returns the ids that were loaded.
    fn load_snapshot(&self, records: &[AnnotationRecord]) -> HashSet<String> {
        let mut annotations = Vec::with_capacity(records.len());
        for record in records {
            match parse_annotation_record(record) {
                Ok(annotation) => annotations.push(annotation),
                Err(err) => {
                    warn!(annotation = %record.id, error = %err, "skipping unreadable annotation");
                    self.events.emit(&SyncEvent::IntegrityError(IntegrityError::Crosswalk(err.to_string())));
                }
            }
        }

        if let Err(err) = self.store.bulk_add_annotations(annotations.clone(), true, Origin::Remote) {
            warn!(error = %err, "snapshot could not replace store contents");
            self.events.emit(&SyncEvent::IntegrityError(err.into()));
            return HashSet::new();
        }
        info!(annotations = annotations.len(), "initial snapshot loaded");
        let loaded = annotations.iter().map(|a| a.id.clone()).collect();
        self.events.emit(&SyncEvent::InitialLoad(annotations));
        loaded
    }

    fn install_hooks(
        &self,
        write_tx: mpsc::UnboundedSender<sender::WriteOp>,
        change_tx: mpsc::UnboundedSender<Vec<BroadcastEvent>>,
        selection_tx: mpsc::UnboundedSender<SelectionBroadcast>,
    ) {
        let store = Arc::clone(&self.store);
        let lifecycle = self.lifecycle.on(move |event| {
            for op in apply_local(&store, event) {
                forward(&write_tx, op, "write");
            }
        });

        let policy = BroadcastPolicy { broadcast_bodies: self.options.broadcast_bodies };
        let observer = self.store.observe(
            move |event| {
                let events = marshal(std::slice::from_ref(event), &policy);
                if !events.is_empty() {
                    forward(&change_tx, events, "change broadcast");
                }
            },
            ObserveOptions::default().origin(Origin::Local),
        );

        let from = self.identity.sender();
        let selection = self.selection.subscribe(move |state| {
            let ids = (!state.selected.is_empty()).then(|| state.selected.clone());
            forward(&selection_tx, SelectionBroadcast { from: from.clone(), ids }, "selection broadcast");
        });

        *self.hooks.lock().unwrap_or_else(PoisonError::into_inner) =
            Hooks { lifecycle: Some(lifecycle), store: Some(observer), selection: Some(selection) };
    }

    fn detach_hooks(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(id) = hooks.lifecycle {
            self.lifecycle.off(id);
        }
        if let Some(id) = hooks.store {
            self.store.unobserve(id);
        }
        if let Some(id) = hooks.selection {
            self.selection.unsubscribe(id);
        }
    }

    async fn leave_quietly(&self, key: &str) {
        if let Err(err) = self.channel.leave(key).await {
            debug!(error = %err, "leave after failed connect");
        }
    }

    // ── Outbound ───────────────────────────────────────────────────

    /// Announces a selection directly, bypassing the selection subscription.
    pub async fn broadcast_selection(&self, ids: Option<Vec<String>>) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::ShutDown);
        }
        let ids = ids.filter(|ids| !ids.is_empty());
        self.channel
            .broadcast_selection(SelectionBroadcast { from: self.identity.sender(), ids })
            .await?;
        Ok(())
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Detaches from the store, stops the loops and the writer, and leaves
    /// the channel. Idempotent. Writes still in flight complete unobserved.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lock_phase(), Phase::ShutDown);
        if previous == Phase::ShutDown {
            return;
        }
        self.detach_hooks();

        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(running) = running else { return };
        running.shutdown.send_replace(true);
        self.leave_quietly(&self.identity.presence_key).await;
        for task in running.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
        info!(presence_key = %self.identity.presence_key, "sync engine shut down");
    }
}

/// Hands `item` to a loop's queue. A closed queue means the loop has stopped;
/// the item is dropped.
fn forward<T>(tx: &mpsc::UnboundedSender<T>, item: T, what: &'static str) -> bool {
    let sent = tx.send(item).is_ok();
    if !sent {
        debug!(what, "queue closed, dropping");
    }
    sent
}

// ── Loops ──────────────────────────────────────────────────────────

struct Inbound {
    store: Arc<Store>,
    presence: Arc<PresenceState>,
    events: Arc<Emitter<SyncEvent>>,
}

impl Inbound {
    async fn run(self, mut inbox: Inbox, mut feed: ChangeFeed, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(message) = inbox.recv() => self.on_channel(message),
                Some(row) = feed.recv() => self.on_row(&row),
                else => break,
            }
        }
        debug!("inbound loop stopped");
    }

    /// Applies the channel messages that queued up while the snapshot loaded.
    fn catch_up(&self, inbox: &mut Inbox, snapshot: &HashSet<String>) {
        while let Ok(mut message) = inbox.try_recv() {
            if let ChannelMessage::Change(change) = &mut message {
                change.events.retain(|event| match event {
                    BroadcastEvent::CreateAnnotation { annotation } if snapshot.contains(&annotation.id) => {
                        debug!(annotation = %annotation.id, "snapshot already holds buffered create");
                        false
                    }
                    _ => true,
                });
            }
            self.on_channel(message);
        }
    }

    fn on_channel(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::Change(message) => {
                for event in &message.events {
                    if let Err(err) = apply_broadcast(&self.store, event) {
                        self.report(err);
                    }
                }
                self.presence.notify_broadcast(&message);
            }
            ChannelMessage::Selection(selection) => {
                self.presence.update_selection(&selection.from.presence_key, selection.ids);
            }
            ChannelMessage::PresenceSync(roster) => self.presence.sync_users(&roster),
        }
    }

    fn on_row(&self, row: &CdcMessage) {
        match reconcile(&self.store, row) {
            Ok(outcome) => debug!(table = ?row.table, event = ?row.event_type, ?outcome, "change row reconciled"),
            Err(err) => self.report(err),
        }
    }

    fn report(&self, err: IntegrityError) {
        warn!(error = %err, "integrity error");
        self.events.emit(&SyncEvent::IntegrityError(err));
    }
}

async fn run_outbound<C: RealtimeChannel>(
    channel: Arc<C>,
    from: Sender,
    mut changes: mpsc::UnboundedReceiver<Vec<BroadcastEvent>>,
    mut selections: mpsc::UnboundedReceiver<SelectionBroadcast>,
    events_per_second: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let pause = (events_per_second > 0).then(|| Duration::from_secs(1) / events_per_second);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(mut events) = changes.recv() => {
                while let Ok(more) = changes.try_recv() {
                    events.extend(more);
                }
                let message = BroadcastMessage { from: from.clone(), events };
                if let Err(err) = channel.broadcast(message).await {
                    warn!(error = %err, "change broadcast failed");
                }
            }
            Some(selection) = selections.recv() => {
                if let Err(err) = channel.broadcast_selection(selection).await {
                    warn!(error = %err, "selection broadcast failed");
                }
            }
            else => break,
        }
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
    }
    debug!("outbound loop stopped");
}
