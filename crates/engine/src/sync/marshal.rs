// Local store changes -> peer broadcast events.

use marginalia_common::model::{Annotation, ChangeEvent};
use marginalia_common::protocol::broadcast::BroadcastEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastPolicy {
    /// When false, body contents never go over the peer channel. Created
    /// annotations are sent without bodies and body creates/updates are
    /// withheld; peers learn about them from the change feed instead.
    pub broadcast_bodies: bool,
}

/// Flattens change events into broadcast events.
///
/// Within each change event the order is: annotation creates, annotation
/// deletes, body creates, body deletes, body updates, target updates.
pub fn marshal(changes: &[ChangeEvent], policy: &BroadcastPolicy) -> Vec<BroadcastEvent> {
    let mut out = Vec::new();
    for event in changes {
        marshal_one(event, policy, &mut out);
    }
    out
}

fn marshal_one(event: &ChangeEvent, policy: &BroadcastPolicy, out: &mut Vec<BroadcastEvent>) {
    let changes = &event.changes;

    out.extend(
        changes
            .created
            .iter()
            .map(|a| BroadcastEvent::CreateAnnotation { annotation: stamp_created(a, policy) }),
    );
    out.extend(changes.deleted.iter().map(|a| BroadcastEvent::DeleteAnnotation { id: a.id.clone() }));

    if policy.broadcast_bodies {
        out.extend(
            changes
                .updated
                .iter()
                .flat_map(|u| &u.bodies_created)
                .map(|body| BroadcastEvent::CreateBody { body: body.clone() }),
        );
    }

    out.extend(changes.updated.iter().flat_map(|u| &u.bodies_deleted).map(|body| {
        BroadcastEvent::DeleteBody { id: body.id.clone(), annotation: body.annotation.clone() }
    }));

    if policy.broadcast_bodies {
        out.extend(
            changes
                .updated
                .iter()
                .flat_map(|u| &u.bodies_updated)
                .map(|change| BroadcastEvent::UpdateBody { body: change.new_body.clone() }),
        );
    }

    out.extend(
        changes
            .updated
            .iter()
            .filter_map(|u| u.target_updated.as_ref())
            .map(|change| BroadcastEvent::UpdateTarget { target: change.new_target.clone() }),
    );
}

/// A fresh annotation is at version 1 once persisted; peers get it stamped
/// so the insert notification that follows is not mistaken for a newer write.
fn stamp_created(annotation: &Annotation, policy: &BroadcastPolicy) -> Annotation {
    let mut annotation =
        if policy.broadcast_bodies { annotation.clone() } else { annotation.without_bodies() };
    annotation.target.version.get_or_insert(1);
    for body in &mut annotation.bodies {
        body.version.get_or_insert(1);
    }
    annotation
}
