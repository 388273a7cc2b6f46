#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use appmgr::{
    Engine,
    config::{HapticsBackend, ManagerConfig},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ tracing を初期化する
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A throwaway device: a read-only `rom` root, a writable `media` root and
/// state directories, all under one temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub config: ManagerConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ManagerConfig::rooted_at(dir.path());
        config.routing_seed = Some(7);
        config.haptics.backend = HapticsBackend::None;
        config.executor.tool_timeout = Duration::from_secs(10);
        config.executor.install_tool = dir.path().join("bin").join("install-tool");
        config.executor.remove_tool = dir.path().join("bin").join("remove-tool");
        for sub in ["rom/applications", "media/applications", "media/packages", "downloads", "bin"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir, config }
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn rom(&self) -> PathBuf {
        self.base().join("rom")
    }

    pub fn media(&self) -> PathBuf {
        self.base().join("media")
    }

    /// Tool invocations are appended here, one line per run
    pub fn tool_log(&self) -> PathBuf {
        self.base().join("tool.log")
    }

    pub fn write_app(&self, root: &Path, id: &str, descriptor: Value) -> PathBuf {
        let folder = root.join("applications").join(id);
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("appinfo.json"), descriptor.to_string()).unwrap();
        folder
    }

    pub fn write_package(&self, root: &Path, id: &str, version: &str, apps: &[&str]) -> PathBuf {
        let folder = root.join("packages").join(id);
        fs::create_dir_all(&folder).unwrap();
        fs::write(
            folder.join("packageinfo.json"),
            json!({"id": id, "version": version, "app": apps}).to_string(),
        )
        .unwrap();
        folder
    }

    fn write_script(&self, path: &Path, body: &str) {
        let script = format!("#!/bin/sh\n{}\n", body);
        fs::write(path, script).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Install tool stand-in. `body` runs after the invocation is logged.
    pub fn install_tool(&self, body: &str) {
        let log = self.tool_log();
        self.write_script(
            &self.config.executor.install_tool,
            &format!("echo \"start $*\" >> {log}\n{body}\necho \"end $*\" >> {log}", log = log.display()),
        );
    }

    pub fn remove_tool(&self, body: &str) {
        let log = self.tool_log();
        self.write_script(
            &self.config.executor.remove_tool,
            &format!("echo \"start $*\" >> {log}\n{body}\necho \"end $*\" >> {log}", log = log.display()),
        );
    }

    /// Shell snippet that lays down `id` as a single-app package on media
    pub fn unpack_snippet(&self, id: &str, version: &str) -> String {
        let folder = self.media().join("applications").join(id);
        let mut descriptor = app_json(id, id);
        descriptor["version"] = json!(version);
        format!(
            "mkdir -p {folder}\ncat > {folder}/appinfo.json <<'JSON'\n{descriptor}\nJSON\necho 'status: unpacking'\necho 'status: installing'\necho 'package: {id}'",
            folder = folder.display(),
        )
    }

    pub fn tool_runs(&self) -> Vec<String> {
        fs::read_to_string(self.tool_log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub async fn engine(&self) -> Engine {
        Engine::new(self.config.clone()).await.unwrap()
    }
}

pub fn app_json(id: &str, title: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "version": "1.0.0",
        "main": "index.html",
        "vendor": "Example"
    })
}
