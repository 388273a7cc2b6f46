//! The hidden-apps list: a JSON array of app ids suppressed from the
//! registered view.

use std::{collections::BTreeSet, path::Path};

use super::{StorageResult, read_json, write_json};

pub async fn load(path: &Path) -> StorageResult<BTreeSet<String>> {
    let ids: Option<Vec<String>> = read_json(path).await?;
    Ok(ids.unwrap_or_default().into_iter().collect())
}

pub async fn save(path: &Path, hidden: &BTreeSet<String>) -> StorageResult<()> {
    let ids: Vec<&String> = hidden.iter().collect();
    write_json(path, &ids).await
}
