//! Storage walk producing the on-disk view.
//!
//! Roots are visited in configuration order and the first root to provide
//! an app id wins, so system apps on the read-only root cannot be shadowed
//! by a user install of the same id. A descriptor that fails to load skips
//! that one folder.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::{ManagerConfig, RootConfig},
    descriptor::{
        Application, LoadContext, Package, Service, load_application, load_package, load_service,
    },
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnDiskView {
    pub apps: BTreeMap<String, Application>,
    pub packages: BTreeMap<String, Package>,
    pub services: BTreeMap<String, Service>,
}

impl OnDiskView {
    /// Point every app at its package and synthesize legacy packages for
    /// apps that have none.
    fn link_packages(&mut self) {
        for package in self.packages.values() {
            for app_id in &package.app_ids {
                if let Some(app) = self.apps.get_mut(app_id) {
                    app.package_id = package.id.clone();
                }
            }
        }
        let orphans: Vec<Package> = self
            .apps
            .values()
            .filter(|app| {
                !self
                    .packages
                    .get(&app.package_id)
                    .is_some_and(|p| p.contains_app(&app.id))
            })
            .map(Package::synthesize_legacy)
            .collect();
        for package in orphans {
            if let Some(app) = self.apps.get_mut(&package.id) {
                app.package_id = package.id.clone();
            }
            self.packages.entry(package.id.clone()).or_insert(package);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
    /// Validation failure (missing field, folder mismatch) rather than a
    /// parse failure
    pub validation: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub view: OnDiskView,
    pub skipped: Vec<SkippedEntry>,
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

struct Scanner<'a> {
    config: &'a ManagerConfig,
    hidden: &'a BTreeSet<String>,
    /// Ids taken by an earlier root, hidden ones included
    claimed: BTreeSet<String>,
    lang: String,
    region: Option<String>,
    outcome: ScanOutcome,
}

impl<'a> Scanner<'a> {
    fn new(config: &'a ManagerConfig, hidden: &'a BTreeSet<String>) -> Self {
        let (lang, region) = config.locale_parts();
        Self {
            config,
            hidden,
            claimed: BTreeSet::new(),
            lang,
            region,
            outcome: ScanOutcome::default(),
        }
    }

    fn skip(&mut self, path: &Path, error: &dyn std::fmt::Display, validation: bool) {
        warn!("skipping {}: {}", path.display(), error);
        self.outcome.skipped.push(SkippedEntry {
            path: path.to_path_buf(),
            reason: error.to_string(),
            validation,
        });
    }

    fn load_app(&mut self, root: &RootConfig, folder: &Path) {
        let ctx = LoadContext {
            lang: &self.lang,
            region: self.region.as_deref(),
            folder_exceptions: &self.config.folder_exceptions,
            read_only: root.read_only,
        };
        let mut app = match load_application(folder, &ctx) {
            Ok(app) => app,
            Err(e) => {
                let validation = e.is_validation();
                self.skip(folder, &e, validation);
                return;
            }
        };
        if !self.claimed.insert(app.id.clone()) {
            debug!("{} already provided by an earlier root", app.id);
            return;
        }
        if self.hidden.contains(&app.id) {
            if root.read_only {
                // shallow-removed system app
                debug!("{} is hidden on a read-only root", app.id);
                return;
            }
            app.visible = false;
        }
        self.outcome.view.apps.insert(app.id.clone(), app);
    }

    fn load_package(&mut self, root: &RootConfig, folder: &Path) {
        match load_package(folder, root.read_only) {
            Ok(package) => {
                self.outcome
                    .view
                    .packages
                    .entry(package.id.clone())
                    .or_insert(package);
            }
            Err(e) => {
                let validation = e.is_validation();
                self.skip(folder, &e, validation);
            }
        }
    }

    fn load_service(&mut self, folder: &Path) {
        let id = folder
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let package_id = self
            .outcome
            .view
            .packages
            .values()
            .find(|p| p.service_ids.contains(&id))
            .map(|p| p.id.clone())
            .unwrap_or_else(|| id.clone());
        match load_service(folder, &package_id) {
            Ok(service) => {
                self.outcome
                    .view
                    .services
                    .entry(service.id.clone())
                    .or_insert(service);
            }
            Err(e) => self.skip(folder, &e, false),
        }
    }

    /// Apps first, then packages, then services: services are owned by the
    /// package that lists them.
    fn scan_all(mut self) -> ScanOutcome {
        let config = self.config;
        for root in &config.roots {
            for folder in subdirs(&root.applications_dir()) {
                self.load_app(root, &folder);
            }
        }
        for root in &config.roots {
            for folder in subdirs(&root.packages_dir()) {
                self.load_package(root, &folder);
            }
        }
        for root in &config.roots {
            for folder in subdirs(&root.services_dir()) {
                self.load_service(&folder);
            }
        }
        self.finish()
    }

    /// Only what belongs to `id`, a package id or an app id.
    fn scan_one(mut self, id: &str) -> ScanOutcome {
        let config = self.config;
        for root in &config.roots {
            let folder = root.packages_dir().join(id);
            if folder.is_dir() {
                self.load_package(root, &folder);
                break;
            }
        }
        let (app_ids, service_ids) = match self.outcome.view.packages.get(id) {
            Some(package) => (package.app_ids.clone(), package.service_ids.clone()),
            None => (vec![id.to_string()], Vec::new()),
        };
        for app_id in &app_ids {
            for root in &config.roots {
                let folder = root.applications_dir().join(app_id);
                if folder.is_dir() {
                    self.load_app(root, &folder);
                    break;
                }
            }
        }
        for service_id in &service_ids {
            for root in &config.roots {
                let folder = root.services_dir().join(service_id);
                if folder.is_dir() {
                    self.load_service(&folder);
                    break;
                }
            }
        }
        self.finish()
    }

    fn finish(mut self) -> ScanOutcome {
        self.outcome.view.link_packages();
        self.outcome
    }
}

/// Walk every configured root.
pub fn scan_once(config: &ManagerConfig, hidden: &BTreeSet<String>) -> ScanOutcome {
    Scanner::new(config, hidden).scan_all()
}

/// Walk only the package or app named `id`.
pub fn scan_target(config: &ManagerConfig, hidden: &BTreeSet<String>, id: &str) -> ScanOutcome {
    Scanner::new(config, hidden).scan_one(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_app(root: &Path, folder: &str, descriptor: serde_json::Value) {
        let dir = root.join("applications").join(folder);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("appinfo.json"), descriptor.to_string()).unwrap();
    }

    #[test]
    fn test_bad_descriptors_are_skipped_not_fatal() {
        let base = tempfile::tempdir().unwrap();
        let config = ManagerConfig::rooted_at(base.path());
        let media = base.path().join("media");

        write_app(&media, "com.example.good", json!({"id": "com.example.good", "title": "Good"}));
        write_app(&media, "com.example.untitled", json!({"id": "com.example.untitled"}));
        write_app(&media, "wrong-folder", json!({"id": "com.example.elsewhere", "title": "X"}));
        let broken = media.join("applications").join("com.example.broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("appinfo.json"), "{ nope").unwrap();

        let outcome = scan_once(&config, &BTreeSet::new());
        assert_eq!(
            outcome.view.apps.keys().collect::<Vec<_>>(),
            vec!["com.example.good"]
        );
        assert_eq!(outcome.skipped.len(), 3);
        assert_eq!(outcome.skipped.iter().filter(|s| s.validation).count(), 2);
        // legacy package synthesized
        assert!(outcome.view.packages["com.example.good"].legacy);
    }

    #[test]
    fn test_read_only_root_wins_and_hidden_handling() {
        let base = tempfile::tempdir().unwrap();
        let config = ManagerConfig::rooted_at(base.path());
        let rom = base.path().join("rom");
        let media = base.path().join("media");

        write_app(&rom, "com.example.sys", json!({"id": "com.example.sys", "title": "System"}));
        write_app(&media, "com.example.sys", json!({"id": "com.example.sys", "title": "Shadow"}));
        write_app(&rom, "com.example.gone", json!({"id": "com.example.gone", "title": "Gone"}));
        // 隠されたシステムアプリの ID は後のルートでも使えない
        write_app(&media, "com.example.gone", json!({"id": "com.example.gone", "title": "Copy"}));
        write_app(&media, "com.example.user", json!({"id": "com.example.user", "title": "User"}));

        let hidden: BTreeSet<String> = ["com.example.gone", "com.example.user"]
            .into_iter()
            .map(String::from)
            .collect();
        let outcome = scan_once(&config, &hidden);
        let apps = &outcome.view.apps;

        assert_eq!(apps["com.example.sys"].title, "System");
        assert!(apps["com.example.sys"].read_only);
        assert!(!apps["com.example.sys"].removable);
        assert!(!apps.contains_key("com.example.gone"));
        assert!(!apps["com.example.user"].visible);
    }

    #[test]
    fn test_package_groups_apps_and_services() {
        let base = tempfile::tempdir().unwrap();
        let config = ManagerConfig::rooted_at(base.path());
        let media = base.path().join("media");

        write_app(&media, "com.example.mail", json!({"id": "com.example.mail", "title": "Mail"}));
        write_app(&media, "com.example.compose", json!({"id": "com.example.compose", "title": "Compose"}));
        let pkg = media.join("packages").join("com.example.suite");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(
            pkg.join("packageinfo.json"),
            json!({
                "id": "com.example.suite",
                "version": "2.0.0",
                "app": ["com.example.mail", "com.example.compose"],
                "services": ["com.example.mail.service"]
            })
            .to_string(),
        )
        .unwrap();
        let svc = media.join("services").join("com.example.mail.service");
        fs::create_dir_all(&svc).unwrap();
        fs::write(svc.join("services.json"), json!({"id": "com.example.mail.service"}).to_string())
            .unwrap();

        let outcome = scan_target(&config, &BTreeSet::new(), "com.example.suite");
        assert_eq!(outcome.view.apps.len(), 2);
        assert_eq!(outcome.view.apps["com.example.mail"].package_id, "com.example.suite");
        assert_eq!(
            outcome.view.services["com.example.mail.service"].package_id,
            "com.example.suite"
        );
        assert!(!outcome.view.packages.contains_key("com.example.mail"));
    }
}
