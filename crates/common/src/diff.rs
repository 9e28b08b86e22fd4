// Structural diff between two snapshots of the same annotation.

use std::collections::HashSet;

use crate::model::{Annotation, Body, Target};

/// What changed between an older and a newer snapshot of one annotation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnnotationDiff {
    /// Bodies present in the new snapshot only.
    pub added_bodies: Vec<Body>,
    /// Bodies present in the old snapshot only.
    pub removed_bodies: Vec<Body>,
    /// New values of bodies present in both snapshots whose fields differ.
    pub changed_bodies: Vec<Body>,
    /// New target, if it differs structurally from the old one.
    pub changed_target: Option<Target>,
}

impl AnnotationDiff {
    pub fn is_empty(&self) -> bool {
        self.added_bodies.is_empty()
            && self.removed_bodies.is_empty()
            && self.changed_bodies.is_empty()
            && self.changed_target.is_none()
    }
}

/// Bodies are matched by id; field values are compared structurally.
pub fn diff_annotations(old: &Annotation, new: &Annotation) -> AnnotationDiff {
    let old_ids: HashSet<&str> = old.bodies.iter().map(|b| b.id.as_str()).collect();
    let new_ids: HashSet<&str> = new.bodies.iter().map(|b| b.id.as_str()).collect();

    let added_bodies =
        new.bodies.iter().filter(|b| !old_ids.contains(b.id.as_str())).cloned().collect();

    let removed_bodies =
        old.bodies.iter().filter(|b| !new_ids.contains(b.id.as_str())).cloned().collect();

    let changed_bodies = new
        .bodies
        .iter()
        .filter(|new_body| old.body(&new_body.id).is_some_and(|old_body| old_body != *new_body))
        .cloned()
        .collect();

    let changed_target = (old.target != new.target).then(|| new.target.clone());

    AnnotationDiff { added_bodies, removed_bodies, changed_bodies, changed_target }
}
