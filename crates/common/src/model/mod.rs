// Annotation data model shared by the store, the sync engine and the wire protocol.

pub mod annotation;
pub mod change;
pub mod presence;
pub mod user;

pub use annotation::{Annotation, AnnotationKey, Body, BodyRef, Selector, Target, Visibility};
pub use change::{BodyUpdate, ChangeEvent, ChangeKind, ChangeSet, Origin, TargetUpdate, Update};
pub use presence::PresentUser;
pub use user::User;
