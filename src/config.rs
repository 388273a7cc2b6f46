use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("No writable root configured")]
    NoWritableRoot,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// App storage roots, scanned in order. The first writable root is the install target.
    #[serde(default = "default_roots")]
    pub roots: Vec<RootConfig>,

    /// `<lang>_<region>`, used for the descriptor fallback chain
    #[serde(default = "default_locale")]
    pub locale: String,

    /// App ids that are allowed to live in a folder not named after them
    #[serde(default = "default_folder_exceptions")]
    pub folder_exceptions: Vec<String>,

    #[serde(default = "default_launch_point_dir")]
    pub launch_point_dir: PathBuf,

    #[serde(default = "default_hidden_apps_path")]
    pub hidden_apps_path: PathBuf,

    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,

    #[serde(default = "default_routing_table_path")]
    pub routing_table_path: PathBuf,

    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Seed for the verb tie-break; entropy when unset
    #[serde(default)]
    pub routing_seed: Option<u64>,

    #[serde(default)]
    pub haptics: HapticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl RootConfig {
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
        }
    }

    pub fn applications_dir(&self) -> PathBuf {
        self.path.join("applications")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.path.join("packages")
    }

    pub fn services_dir(&self) -> PathBuf {
        self.path.join("services")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_install_tool")]
    pub install_tool: PathBuf,

    #[serde(default = "default_remove_tool")]
    pub remove_tool: PathBuf,

    /// File name of the optional pre-remove script inside a package folder
    #[serde(default = "default_pre_remove_script")]
    pub pre_remove_script: String,

    /// Recorded in package manifests; a change invalidates them
    #[serde(default = "default_installer_version")]
    pub installer_version: String,

    /// Kill a tool that runs longer than this. Zero disables the watchdog.
    #[serde(default = "default_tool_timeout", with = "duration_ms")]
    pub tool_timeout: Duration,

    /// Number of finished commands kept for snapshots
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            install_tool: default_install_tool(),
            remove_tool: default_remove_tool(),
            pre_remove_script: default_pre_remove_script(),
            installer_version: default_installer_version(),
            tool_timeout: default_tool_timeout(),
            history_size: default_history_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HapticsBackend {
    #[default]
    Auto,
    Sysfs,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HapticsConfig {
    #[serde(default)]
    pub backend: HapticsBackend,

    #[serde(default = "default_vibrator_path")]
    pub sysfs_path: PathBuf,
}

impl Default for HapticsConfig {
    fn default() -> Self {
        Self {
            backend: HapticsBackend::default(),
            sysfs_path: default_vibrator_path(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            locale: default_locale(),
            folder_exceptions: default_folder_exceptions(),
            launch_point_dir: default_launch_point_dir(),
            hidden_apps_path: default_hidden_apps_path(),
            manifest_dir: default_manifest_dir(),
            routing_table_path: default_routing_table_path(),
            download_dir: default_download_dir(),
            executor: ExecutorConfig::default(),
            event_buffer_size: default_event_buffer_size(),
            routing_seed: None,
            haptics: HapticsConfig::default(),
        }
    }
}

impl ManagerConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        from_file(path)
    }

    /// Config rooted entirely under `base`, with one read-only and one writable root.
    pub fn rooted_at<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        Self {
            roots: vec![
                RootConfig::new(base.join("rom"), true),
                RootConfig::new(base.join("media"), false),
            ],
            launch_point_dir: base.join("launchpoints"),
            hidden_apps_path: base.join("hidden-apps.json"),
            manifest_dir: base.join("manifests"),
            routing_table_path: base.join("routing-table.json"),
            download_dir: base.join("downloads"),
            ..Default::default()
        }
    }

    pub fn install_root(&self) -> ConfigResult<&RootConfig> {
        self.roots
            .iter()
            .find(|root| !root.read_only)
            .ok_or(ConfigError::NoWritableRoot)
    }

    /// (lang, region) split of the configured locale
    pub fn locale_parts(&self) -> (String, Option<String>) {
        let mut parts = self.locale.splitn(2, '_');
        let lang = parts.next().unwrap_or_default().to_lowercase();
        let region = parts
            .next()
            .filter(|r| !r.is_empty())
            .map(|r| r.to_lowercase());
        (lang, region)
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ConfigError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// デフォルト値の定義
fn default_roots() -> Vec<RootConfig> {
    vec![
        RootConfig::new("/usr/palm", true),
        RootConfig::new("/media/cryptofs", false),
    ]
}
fn default_locale() -> String {
    "en_us".to_string()
}
fn default_folder_exceptions() -> Vec<String> {
    vec![
        "com.palm.app.firstuse".to_string(),
        "com.palm.launcher".to_string(),
    ]
}
fn default_launch_point_dir() -> PathBuf {
    PathBuf::from("/var/luna/data/launchpoints")
}
fn default_hidden_apps_path() -> PathBuf {
    PathBuf::from("/var/luna/data/hidden-apps.json")
}
fn default_manifest_dir() -> PathBuf {
    PathBuf::from("/var/luna/data/manifests")
}
fn default_routing_table_path() -> PathBuf {
    PathBuf::from("/var/luna/data/routing-table.json")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("/media/internal/downloads")
}
fn default_install_tool() -> PathBuf {
    PathBuf::from("/usr/bin/ipkg-tool")
}
fn default_remove_tool() -> PathBuf {
    PathBuf::from("/usr/bin/ipkg-tool")
}
fn default_pre_remove_script() -> String {
    "pmPreRemove.script".to_string()
}
fn default_installer_version() -> String {
    "1".to_string()
}
fn default_tool_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_history_size() -> usize {
    64
}
fn default_event_buffer_size() -> usize {
    1000
}
fn default_vibrator_path() -> PathBuf {
    PathBuf::from("/sys/class/timed_output/vibrator/enable")
}

// Duration型のシリアライズ/デシリアライズヘルパー
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
