use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::descriptor::Application;

/// Three disjoint id sets: on disk only, registered only, and present in
/// both but failing the strict compare.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ReconcileDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

/// Diff the registered view against the on-disk view. With a `scope`, only
/// those ids are considered; everything else is left alone.
pub fn compute(
    registered: &BTreeMap<String, Application>,
    on_disk: &BTreeMap<String, Application>,
    scope: Option<&BTreeSet<String>>,
) -> ReconcileDiff {
    let in_scope = |id: &String| scope.is_none_or(|s| s.contains(id));
    let mut diff = ReconcileDiff::default();

    for (id, disk) in on_disk.iter().filter(|(id, _)| in_scope(id)) {
        match registered.get(id) {
            None => diff.added.push(id.clone()),
            Some(current) if !current.strict_eq(disk) => diff.changed.push(id.clone()),
            Some(_) => {}
        }
    }
    diff.removed = registered
        .keys()
        .filter(|id| in_scope(id) && !on_disk.contains_key(*id))
        .cloned()
        .collect();
    diff
}
