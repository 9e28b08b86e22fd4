// marginalia-common: shared annotation model, diffing and wire protocol

pub mod collaborators;
pub mod diff;
pub mod model;
pub mod protocol;
