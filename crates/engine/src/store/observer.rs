// Observer registration and filtering for store change events.

use std::collections::HashSet;
use std::sync::Arc;

use marginalia_common::model::{ChangeEvent, ChangeKind, Origin};

/// Handle returned by `Store::observe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

pub(crate) type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Narrows which change events an observer receives. All filters are optional.
#[derive(Debug, Clone, Default)]
pub struct ObserveOptions {
    pub origin: Option<Origin>,
    pub affects: Option<ChangeKind>,
    pub annotations: Option<HashSet<String>>,
}

impl ObserveOptions {
    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn affects(mut self, kind: ChangeKind) -> Self {
        self.affects = Some(kind);
        self
    }

    pub fn annotations<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.annotations = Some(ids.into_iter().map(Into::into).collect());
        self
    }
}

pub(crate) struct Observer {
    pub id: ObserverId,
    pub callback: Callback,
    pub options: ObserveOptions,
}

/// Filter order: origin, then change kind, then annotation ids.
///
/// Whole-annotation changes reach every observer that passes the origin
/// filter. Target and body changes reach observers that asked for that kind,
/// for whole annotations, or for nothing in particular.
pub(crate) fn should_notify(options: &ObserveOptions, event: &ChangeEvent) -> bool {
    if options.origin.is_some_and(|origin| origin != event.origin) {
        return false;
    }

    let wants = |kind: ChangeKind| match options.affects {
        None | Some(ChangeKind::Annotation) => true,
        Some(wanted) => wanted == kind,
    };

    let relevant_kind = match event.affects {
        ChangeKind::Annotation => true,
        kind => wants(kind),
    };
    if !relevant_kind {
        return false;
    }

    match &options.annotations {
        Some(observed) => {
            event.changes.affected_ids().into_iter().any(|id| observed.contains(id))
        }
        None => true,
    }
}
