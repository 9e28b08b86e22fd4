// Users who created or edited any part of an annotation.

use crate::model::{Annotation, User};

/// Creators and updaters of the target and every body, in that order.
///
/// Each user appears once, at the position of their first mention.
pub fn collaborators(annotation: &Annotation) -> Vec<User> {
    let target = &annotation.target;
    let mentions = [target.creator.as_ref(), target.updated_by.as_ref()]
        .into_iter()
        .chain(annotation.bodies.iter().flat_map(|b| [b.creator.as_ref(), b.updated_by.as_ref()]))
        .flatten();

    let mut users: Vec<User> = Vec::new();
    for user in mentions {
        if !users.iter().any(|known| known.id() == user.id()) {
            users.push(user.clone());
        }
    }
    users
}
