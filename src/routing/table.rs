use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    io::Write,
    path::Path,
};

use indexmap::IndexMap;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    ExtensionMap, Handler, HandlerKind, HandlerNode, IndexAllocator, RoutingError, RoutingResult,
};
use crate::descriptor::Application;

/// One request to register an app as a handler for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRegistration {
    pub key: String,
    pub app_id: String,
    pub kind: HandlerKind,
    pub should_download_first: bool,
    pub verbs: BTreeMap<String, String>,
    pub system_default: bool,
    pub scheme_form: bool,
}

impl HandlerRegistration {
    pub fn resource(mime: &str, app_id: &str) -> Self {
        Self {
            key: mime.to_string(),
            app_id: app_id.to_string(),
            kind: HandlerKind::Resource,
            should_download_first: false,
            verbs: BTreeMap::new(),
            system_default: false,
            scheme_form: false,
        }
    }

    pub fn redirect(pattern: &str, app_id: &str) -> Self {
        Self {
            kind: HandlerKind::Redirect,
            ..Self::resource(pattern, app_id)
        }
    }

    pub fn with_verbs<I, K, V>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.verbs = verbs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn system_default(mut self, system_default: bool) -> Self {
        self.system_default = system_default;
        self
    }

    fn normalized_key(&self) -> String {
        match self.kind {
            HandlerKind::Resource => self.key.to_lowercase(),
            HandlerKind::Redirect => self.key.clone(),
        }
    }
}

/// Result of a resource or redirect lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub key: String,
    pub kind: HandlerKind,
    pub active: Handler,
    pub alternates: Vec<Handler>,
}

impl Resolution {
    fn from_node(node: &HandlerNode) -> Self {
        Self {
            key: node.key.clone(),
            kind: node.kind,
            active: node.primary().clone(),
            alternates: node.alternates().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerSummary {
    pub key: String,
    pub kind: HandlerKind,
    pub index: u32,
    pub primary: bool,
}

/// Persisted form of the table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSnapshot {
    #[serde(flatten)]
    pub indices: IndexAllocator,
    #[serde(default)]
    pub resources: BTreeMap<String, HandlerNode>,
    /// Matched in registration order
    #[serde(default)]
    pub redirects: IndexMap<String, HandlerNode>,
    #[serde(default)]
    pub extensions: ExtensionMap,
}

impl RoutingSnapshot {
    /// Every node non-empty and filed under its own key, every index held by
    /// exactly one handler and not free, every verb choice pointing into its
    /// node.
    pub fn validate(&self) -> RoutingResult<()> {
        let inconsistent = |message: String| Err(RoutingError::Inconsistent(message));
        let mut seen = BTreeSet::new();
        let nodes = self
            .resources
            .iter()
            .map(|(key, node)| (key, node, HandlerKind::Resource))
            .chain(
                self.redirects
                    .iter()
                    .map(|(key, node)| (key, node, HandlerKind::Redirect)),
            );
        for (key, node, kind) in nodes {
            if node.is_empty() {
                return inconsistent(format!("node '{}' has no handlers", key));
            }
            if &node.key != key || node.kind != kind {
                return inconsistent(format!("node '{}' is filed under '{}'", node.key, key));
            }
            for handler in node.handlers() {
                if handler.kind != kind {
                    return inconsistent(format!(
                        "handler {} under '{}' has kind {}",
                        handler.index, key, handler.kind
                    ));
                }
                if self.indices.is_free(handler.index) {
                    return inconsistent(format!("index {} is in use but free", handler.index));
                }
                if !seen.insert(handler.index) {
                    return inconsistent(format!("index {} is used twice", handler.index));
                }
            }
            for (verb, entry) in node.verb_cache() {
                if node.find(entry.chosen_index).is_none() {
                    return inconsistent(format!(
                        "verb '{}' under '{}' points at missing index {}",
                        verb, key, entry.chosen_index
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    indices: IndexAllocator,
    resources: BTreeMap<String, HandlerNode>,
    redirects: IndexMap<String, HandlerNode>,
    extensions: ExtensionMap,
    patterns: HashMap<String, Regex>,
    rng: StdRng,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(None)
    }
}

fn compile_pattern(pattern: &str) -> RoutingResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| RoutingError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

impl RoutingTable {
    /// `seed` fixes the verb tie-break; entropy otherwise.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            indices: IndexAllocator::new(),
            resources: BTreeMap::new(),
            redirects: IndexMap::new(),
            extensions: ExtensionMap::default(),
            patterns: HashMap::new(),
            rng: Self::rng(seed),
        }
    }

    fn rng(seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Register a handler and return its index. Registering the same
    /// (key, app, kind) twice is a no-op returning the existing index.
    pub fn add_handler(&mut self, registration: HandlerRegistration) -> RoutingResult<u32> {
        let key = registration.normalized_key();

        if registration.kind == HandlerKind::Redirect && !self.patterns.contains_key(&key) {
            let regex = compile_pattern(&key)?;
            self.patterns.insert(key.clone(), regex);
        }

        let existing = match registration.kind {
            HandlerKind::Resource => self.resources.get(&key),
            HandlerKind::Redirect => self.redirects.get(&key),
        }
        .and_then(|node| node.find_app(&registration.app_id))
        .map(|h| h.index);
        if let Some(index) = existing {
            return Ok(index);
        }

        let handler = Handler {
            index: self.indices.allocate(),
            app_id: registration.app_id,
            kind: registration.kind,
            should_download_first: registration.should_download_first,
            verbs: registration.verbs,
            system_default: registration.system_default,
            scheme_form: registration.scheme_form,
        };
        let index = handler.index;
        debug!("add handler {} for '{}' -> {}", index, key, handler.app_id);

        match handler.kind {
            HandlerKind::Resource => match self.resources.get_mut(&key) {
                Some(node) => node.push_alternate(handler),
                None => {
                    self.resources
                        .insert(key.clone(), HandlerNode::new(&key, handler));
                }
            },
            HandlerKind::Redirect => match self.redirects.get_mut(&key) {
                Some(node) => node.push_alternate(handler),
                None => {
                    self.redirects
                        .insert(key.clone(), HandlerNode::new(&key, handler));
                }
            },
        }
        Ok(index)
    }

    /// Register every resource and redirect declared by `app`. Apps from
    /// read-only roots become system defaults. A bad URL pattern skips that
    /// registration only.
    #[instrument(skip(self, app), fields(app_id = %app.id), level = "debug")]
    pub fn register_app(&mut self, app: &Application) -> Vec<u32> {
        let mut indices = Vec::new();
        for resource in &app.resource_registrations {
            if let Some(ext) = &resource.extension {
                self.extensions.insert_if_absent(ext, &resource.mime);
            }
            let registration = HandlerRegistration {
                should_download_first: resource.should_download_first,
                verbs: resource.verbs.clone(),
                ..HandlerRegistration::resource(&resource.mime, &app.id)
            }
            .system_default(app.read_only);
            match self.add_handler(registration) {
                Ok(index) => indices.push(index),
                Err(e) => warn!("skipping resource registration of {}: {}", app.id, e),
            }
        }
        for redirect in &app.redirect_registrations {
            let registration = HandlerRegistration {
                verbs: redirect.verbs.clone(),
                scheme_form: redirect.scheme_form,
                ..HandlerRegistration::redirect(&redirect.pattern, &app.id)
            }
            .system_default(app.read_only);
            match self.add_handler(registration) {
                Ok(index) => indices.push(index),
                Err(e) => warn!("skipping redirect registration of {}: {}", app.id, e),
            }
        }
        indices
    }

    /// Mime key for a lookup given either a mime type or a file extension
    fn resource_key(&self, mime_or_extension: &str) -> Option<String> {
        let key = mime_or_extension.to_lowercase();
        if self.resources.contains_key(&key) {
            return Some(key);
        }
        if key.contains('/') {
            return None;
        }
        self.extensions.mime_for(&key).map(str::to_string)
    }

    fn node(&self, key: &str) -> Option<&HandlerNode> {
        match self.resource_key(key) {
            Some(mime) => self.resources.get(&mime),
            None => self.redirects.get(key),
        }
    }

    /// Active handler for an exact key (mime type, extension or URL pattern).
    pub fn resolve(&self, key: &str) -> Option<&Handler> {
        self.node(key).map(HandlerNode::primary)
    }

    pub fn handler_node(&self, key: &str) -> Option<&HandlerNode> {
        self.node(key)
    }

    pub fn resolve_resource(&self, mime_or_extension: &str) -> Option<Resolution> {
        let mime = self.resource_key(mime_or_extension)?;
        self.resources.get(&mime).map(Resolution::from_node)
    }

    /// First redirect node, in registration order, whose pattern matches `url`.
    pub fn resolve_redirect(&self, url: &str) -> Option<Resolution> {
        self.redirects
            .values()
            .find(|node| {
                self.patterns
                    .get(&node.key)
                    .is_some_and(|regex| regex.is_match(url))
            })
            .map(Resolution::from_node)
    }

    /// Redirect patterns first, then the extension of the URL path.
    pub fn resolve_for_url(&self, url: &str) -> Option<Resolution> {
        if let Some(resolution) = self.resolve_redirect(url) {
            return Some(resolution);
        }
        let path = match url::Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        let file_name = path.rsplit('/').next()?;
        let (_, extension) = file_name.rsplit_once('.')?;
        let mime = self.extensions.mime_for(extension)?;
        self.resources.get(mime).map(Resolution::from_node)
    }

    /// Handler answering `verb` for `key`. The cached choice wins while it is
    /// still registered with that verb; otherwise one of the eligible
    /// handlers is picked at random and cached.
    pub fn resolve_by_verb(&mut self, key: &str, verb: &str) -> Option<Handler> {
        let node = match self.resource_key(key) {
            Some(mime) => self.resources.get_mut(&mime)?,
            None => self.redirects.get_mut(key)?,
        };
        if let Some(handler) = node.cached_for_verb(verb) {
            return Some(handler);
        }
        let chosen = node
            .verb_candidates(verb)
            .choose(&mut self.rng)
            .map(|h| h.index)?;
        node.cache_verb(verb, chosen);
        debug!("verb '{}' on '{}' now answered by {}", verb, key, chosen);
        node.find(chosen).cloned()
    }

    fn node_mut(&mut self, key: &str) -> RoutingResult<&mut HandlerNode> {
        let node = match self.resource_key(key) {
            Some(mime) => self.resources.get_mut(&mime),
            None => self.redirects.get_mut(key),
        };
        node.ok_or_else(|| RoutingError::NodeNotFound(key.to_string()))
    }

    /// Promote the alternate with `index` to primary.
    pub fn swap(&mut self, key: &str, index: u32) -> RoutingResult<()> {
        let node = self.node_mut(key)?;
        if node.swap(index) {
            Ok(())
        } else {
            Err(RoutingError::IndexNotFound {
                key: key.to_string(),
                index,
            })
        }
    }

    /// Remove every handler owned by `app_id` from both tables. Emptied
    /// nodes are deleted and the freed indices recycled.
    #[instrument(skip(self), level = "debug")]
    pub fn remove_all_for_app_id(&mut self, app_id: &str) -> Vec<u32> {
        let mut freed = Vec::new();
        for node in self.resources.values_mut() {
            freed.extend(node.remove_app(app_id));
        }
        self.resources.retain(|_, node| !node.is_empty());
        for node in self.redirects.values_mut() {
            freed.extend(node.remove_app(app_id));
        }
        self.redirects.retain(|_, node| !node.is_empty());
        let redirects = &self.redirects;
        self.patterns.retain(|pattern, _| redirects.contains_key(pattern));

        for index in &freed {
            self.indices.release(*index);
        }
        freed
    }

    pub fn register_verbs(
        &mut self,
        key: &str,
        app_id: &str,
        verbs: BTreeMap<String, String>,
    ) -> RoutingResult<()> {
        let node = self.node_mut(key)?;
        if node.set_verbs(app_id, verbs) {
            Ok(())
        } else {
            Err(RoutingError::HandlerNotFound {
                key: key.to_string(),
                app_id: app_id.to_string(),
            })
        }
    }

    /// Put the system default handler for `key` back in front. Returns its
    /// index, or None when the key has no system default.
    pub fn restore_default_handler(&mut self, key: &str) -> RoutingResult<Option<u32>> {
        let node = self.node_mut(key)?;
        let Some(index) = node
            .handlers()
            .iter()
            .find(|h| h.system_default)
            .map(|h| h.index)
        else {
            return Ok(None);
        };
        node.swap(index);
        Ok(Some(index))
    }

    pub fn list_handlers(&self, app_id: &str) -> Vec<HandlerSummary> {
        self.resources
            .values()
            .chain(self.redirects.values())
            .flat_map(|node| {
                node.handlers()
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.app_id == app_id)
                    .map(|(pos, h)| HandlerSummary {
                        key: node.key.clone(),
                        kind: h.kind,
                        index: h.index,
                        primary: pos == 0,
                    })
            })
            .collect()
    }

    /// Every app id that owns at least one handler
    pub fn app_ids(&self) -> BTreeSet<String> {
        self.resources
            .values()
            .chain(self.redirects.values())
            .flat_map(|node| node.handlers().iter().map(|h| h.app_id.clone()))
            .collect()
    }

    pub fn extensions(&self) -> &ExtensionMap {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut ExtensionMap {
        &mut self.extensions
    }

    pub fn node_count(&self) -> usize {
        self.resources.len() + self.redirects.len()
    }

    pub fn snapshot(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            indices: self.indices.clone(),
            resources: self.resources.clone(),
            redirects: self.redirects.clone(),
            extensions: self.extensions.clone(),
        }
    }

    /// Replace the whole table with `snapshot`. On error the table is left
    /// untouched.
    pub fn replace_with(&mut self, snapshot: RoutingSnapshot) -> RoutingResult<()> {
        snapshot.validate()?;
        let patterns = snapshot
            .redirects
            .keys()
            .map(|pattern| compile_pattern(pattern).map(|regex| (pattern.clone(), regex)))
            .collect::<RoutingResult<HashMap<_, _>>>()?;
        self.indices = snapshot.indices;
        self.resources = snapshot.resources;
        self.redirects = snapshot.redirects;
        self.extensions = snapshot.extensions;
        self.patterns = patterns;
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> RoutingResult<()> {
        let path = path.as_ref();
        let io_err = |source| RoutingError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(&self.snapshot()).map_err(|source| {
            RoutingError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        // 一時ファイルに書いてから rename する
        let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        temp_file.write_all(&json).map_err(io_err)?;
        temp_file.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Load the table saved at `path`, replacing the current contents.
    pub fn restore<P: AsRef<Path>>(&mut self, path: P) -> RoutingResult<()> {
        let path = path.as_ref();
        let content = fs::read(path).map_err(|source| RoutingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: RoutingSnapshot =
            serde_json::from_slice(&content).map_err(|source| RoutingError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        self.replace_with(snapshot)
    }
}
