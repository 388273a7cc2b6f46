use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Flat file-extension to mime-type table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionMap {
    entries: BTreeMap<String, String>,
}

const DEFAULT_EXTENSIONS: &[(&str, &str)] = &[
    ("mp3", "audio/mpa"),
    ("aac", "audio/aac"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("3gp", "video/3gpp"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("vcf", "text/x-vcard"),
    ("ics", "text/calendar"),
];

impl Default for ExtensionMap {
    fn default() -> Self {
        Self {
            entries: DEFAULT_EXTENSIONS
                .iter()
                .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
                .collect(),
        }
    }
}

fn normalize(extension: &str) -> String {
    extension.trim_start_matches('.').to_lowercase()
}

impl ExtensionMap {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn mime_for(&self, extension: &str) -> Option<&str> {
        self.entries.get(&normalize(extension)).map(String::as_str)
    }

    /// Map `extension` to `mime` unless it is already mapped. Returns whether
    /// the table changed.
    pub fn insert_if_absent(&mut self, extension: &str, mime: &str) -> bool {
        let key = normalize(extension);
        if key.is_empty() || self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, mime.to_lowercase());
        true
    }

    pub fn set(&mut self, extension: &str, mime: &str) -> Option<String> {
        self.entries.insert(normalize(extension), mime.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
