//! Minimal-diff reconciliation of topic snapshots.
//!
//! Replacing the displayed topic list wholesale on every background refresh
//! causes re-render churn even when nothing material changed. The merge here
//! keeps the existing `Arc` for every row whose (id, count) is unchanged, so
//! downstream change detection can compare by pointer identity.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::Topic;

/// True when the fresh snapshot differs materially from the displayed list:
/// lengths differ, or any positional (id, count) pair differs.
pub fn changed(previous: &[Arc<Topic>], fresh: &[Topic]) -> bool {
    if previous.len() != fresh.len() {
        return true;
    }
    previous
        .iter()
        .zip(fresh.iter())
        .any(|(old, new)| old.id != new.id || old.count != new.count)
}

/// Merge a fresh snapshot into the displayed list.
///
/// Server order is authoritative. Rows already displayed keep their `Arc`
/// when the count is unchanged; a changed count produces a new row that
/// preserves every other field of the displayed topic (including any richer
/// sample-idea data). Rows absent from the fresh snapshot are dropped.
pub fn merge(previous: &[Arc<Topic>], fresh: Vec<Topic>, is_initial: bool) -> Vec<Arc<Topic>> {
    if is_initial {
        return fresh.into_iter().map(Arc::new).collect();
    }
    if !changed(previous, &fresh) {
        return previous.to_vec();
    }

    let by_id: HashMap<&str, &Arc<Topic>> = previous
        .iter()
        .map(|topic| (topic.id.as_str(), topic))
        .collect();

    fresh
        .into_iter()
        .map(|incoming| match by_id.get(incoming.id.as_str()) {
            None => Arc::new(incoming),
            Some(existing) if existing.count == incoming.count => Arc::clone(existing),
            Some(existing) => {
                let mut updated = Topic::clone(existing);
                updated.count = incoming.count;
                Arc::new(updated)
            }
        })
        .collect()
}
