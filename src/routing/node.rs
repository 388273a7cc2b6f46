use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HandlerKind {
    Resource,
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handler {
    pub index: u32,
    pub app_id: String,
    pub kind: HandlerKind,
    #[serde(default)]
    pub should_download_first: bool,
    #[serde(default)]
    pub verbs: BTreeMap<String, String>,
    #[serde(default)]
    pub system_default: bool,
    #[serde(default)]
    pub scheme_form: bool,
}

impl Handler {
    pub fn has_verb(&self, verb: &str) -> bool {
        self.verbs.contains_key(verb)
    }
}

/// Which handler currently answers a verb among several eligible ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbCacheEntry {
    pub chosen_index: u32,
    pub use_count: u64,
}

/// All handlers registered under one key.
///
/// `handlers[0]` is the primary (active) handler, the rest are alternates in
/// rank order. A node is never empty; the table deletes it instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerNode {
    pub key: String,
    pub kind: HandlerKind,
    handlers: Vec<Handler>,
    #[serde(default)]
    verb_cache: BTreeMap<String, VerbCacheEntry>,
}

impl HandlerNode {
    pub fn new(key: &str, primary: Handler) -> Self {
        Self {
            key: key.to_string(),
            kind: primary.kind,
            handlers: vec![primary],
            verb_cache: BTreeMap::new(),
        }
    }

    pub fn primary(&self) -> &Handler {
        &self.handlers[0]
    }

    pub fn alternates(&self) -> &[Handler] {
        &self.handlers[1..]
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn find(&self, index: u32) -> Option<&Handler> {
        self.handlers.iter().find(|h| h.index == index)
    }

    pub fn find_app(&self, app_id: &str) -> Option<&Handler> {
        self.handlers.iter().find(|h| h.app_id == app_id)
    }

    pub fn push_alternate(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    /// Promote the handler with `index` to primary. The demoted primary takes
    /// the promoted handler's old rank, so swapping back restores the node.
    pub fn swap(&mut self, index: u32) -> bool {
        match self.handlers.iter().position(|h| h.index == index) {
            Some(0) => true,
            Some(pos) => {
                self.handlers.swap(0, pos);
                true
            }
            None => false,
        }
    }

    /// Remove every handler owned by `app_id` and return their indices. The
    /// oldest remaining alternate becomes primary when the primary goes.
    pub fn remove_app(&mut self, app_id: &str) -> Vec<u32> {
        let removed: Vec<u32> = self
            .handlers
            .iter()
            .filter(|h| h.app_id == app_id)
            .map(|h| h.index)
            .collect();
        if removed.is_empty() {
            return removed;
        }
        self.handlers.retain(|h| h.app_id != app_id);
        self.verb_cache
            .retain(|_, entry| !removed.contains(&entry.chosen_index));
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Replace the verbs of `app_id`'s handler. Cached choices that no longer
    /// advertise their verb are dropped.
    pub fn set_verbs(&mut self, app_id: &str, verbs: BTreeMap<String, String>) -> bool {
        let Some(handler) = self.handlers.iter_mut().find(|h| h.app_id == app_id) else {
            return false;
        };
        handler.verbs = verbs;
        let handlers = &self.handlers;
        self.verb_cache.retain(|verb, entry| {
            handlers
                .iter()
                .any(|h| h.index == entry.chosen_index && h.has_verb(verb))
        });
        true
    }

    pub fn verb_candidates(&self, verb: &str) -> Vec<&Handler> {
        self.handlers.iter().filter(|h| h.has_verb(verb)).collect()
    }

    /// Cached handler for `verb` if it is still eligible. Bumps the use count.
    pub fn cached_for_verb(&mut self, verb: &str) -> Option<Handler> {
        let chosen = self.verb_cache.get(verb)?.chosen_index;
        let handler = self
            .handlers
            .iter()
            .find(|h| h.index == chosen && h.has_verb(verb))
            .cloned();
        match handler {
            Some(handler) => {
                if let Some(entry) = self.verb_cache.get_mut(verb) {
                    entry.use_count += 1;
                }
                Some(handler)
            }
            None => {
                self.verb_cache.remove(verb);
                None
            }
        }
    }

    pub fn cache_verb(&mut self, verb: &str, index: u32) {
        self.verb_cache.insert(
            verb.to_string(),
            VerbCacheEntry {
                chosen_index: index,
                use_count: 1,
            },
        );
    }

    pub fn verb_cache(&self) -> &BTreeMap<String, VerbCacheEntry> {
        &self.verb_cache
    }
}
