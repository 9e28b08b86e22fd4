// marginalia-engine: annotation store, selection lifecycle, presence and
// realtime sync against a durable backing store.

pub mod config;
pub mod events;
pub mod hover;
pub mod lifecycle;
pub mod presence;
pub mod selection;
pub mod store;
pub mod sync;
