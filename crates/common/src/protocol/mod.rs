// Wire formats: peer broadcast, presence, backing-store change capture, and
// the relay socket frames.

pub mod broadcast;
pub mod cdc;
pub mod presence;
pub mod records;
pub mod ws;
