use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use super::{StorageResult, io_error, read_json, remove_file, write_json};
use crate::descriptor::LaunchPoint;

/// Dynamic launch points, persisted as `<dir>/<launch-point-id>.json`.
#[derive(Debug, Clone)]
pub struct LaunchPointStore {
    dir: PathBuf,
}

impl LaunchPointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Every readable launch point in the directory. Unreadable files are
    /// skipped with a warning.
    pub async fn load_all(&self) -> StorageResult<Vec<LaunchPoint>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };
        let mut launch_points = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<LaunchPoint>(&path).await {
                Ok(Some(lp)) if !lp.default => launch_points.push(lp),
                Ok(_) => {}
                Err(e) => warn!("skipping launch point file: {}", e),
            }
        }
        launch_points.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(launch_points)
    }

    pub async fn save(&self, launch_point: &LaunchPoint) -> StorageResult<()> {
        write_json(&self.path_for(&launch_point.id), launch_point).await
    }

    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        remove_file(&self.path_for(id)).await
    }

    /// Delete every persisted launch point of `app_id`, returning the ids.
    pub async fn delete_for_app(&self, app_id: &str) -> StorageResult<Vec<String>> {
        let mut deleted = Vec::new();
        for lp in self.load_all().await? {
            if lp.app_id == app_id && self.delete(&lp.id).await? {
                deleted.push(lp.id);
            }
        }
        Ok(deleted)
    }

    /// First free id of the form `<app_id>_<n>`, n starting at 1.
    pub async fn next_id(&self, app_id: &str) -> String {
        let mut n = 1u32;
        loop {
            let id = format!("{}_{}", app_id, n);
            if fs::metadata(self.path_for(&id)).await.is_err() {
                return id;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_load_and_delete_for_app() {
        let dir = tempfile::tempdir().unwrap();
        let store = LaunchPointStore::new(dir.path().join("lp"));
        assert!(store.load_all().await.unwrap().is_empty());

        let id = store.next_id("com.example.a").await;
        assert_eq!(id, "com.example.a_1");
        let lp = LaunchPoint::dynamic(id, "com.example.a", "Inbox", "", json!({"folder": "inbox"}));
        store.save(&lp).await.unwrap();
        assert_eq!(store.next_id("com.example.a").await, "com.example.a_2");

        let other = LaunchPoint::dynamic(
            store.next_id("com.example.b").await,
            "com.example.b",
            "B",
            "",
            serde_json::Value::Null,
        );
        store.save(&other).await.unwrap();
        std::fs::write(dir.path().join("lp").join("junk.json"), b"[").unwrap();

        assert_eq!(store.load_all().await.unwrap(), vec![lp, other.clone()]);
        assert_eq!(
            store.delete_for_app("com.example.a").await.unwrap(),
            vec!["com.example.a_1".to_string()]
        );
        assert_eq!(store.load_all().await.unwrap(), vec![other]);
    }
}
