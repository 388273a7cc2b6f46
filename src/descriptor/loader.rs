//! Descriptor file loading.
//!
//! App descriptors are looked up along a locale fallback chain inside the app
//! folder (`resources/<lang>/<region>/`, `resources/<lang>/`, then the folder
//! itself). The first file that exists wins; a file that exists but fails to
//! parse is an error, not a reason to fall back further.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use super::{
    AppKind, Application, DescriptorError, DescriptorResult, HardwareFeatures, LaunchPoint,
    Package, RedirectRegistration, ResourceRegistration, Service,
};

pub const APP_DESCRIPTOR: &str = "appinfo.json";
pub const PACKAGE_DESCRIPTOR: &str = "packageinfo.json";
pub const SERVICE_DESCRIPTOR: &str = "services.json";

/// Per-root loading parameters
#[derive(Debug, Clone, Copy)]
pub struct LoadContext<'a> {
    pub lang: &'a str,
    pub region: Option<&'a str>,
    pub folder_exceptions: &'a [String],
    pub read_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppDescriptor {
    id: Option<String>,
    title: Option<String>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(rename = "type", default)]
    kind: AppKind,
    #[serde(default)]
    main: String,
    #[serde(default)]
    icon: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    vendor: String,
    #[serde(default, alias = "vendorurl")]
    vendor_url: String,
    #[serde(default = "default_true")]
    removable: bool,
    #[serde(default)]
    user_hideable: bool,
    #[serde(default = "default_true")]
    visible: bool,
    #[serde(default)]
    no_window: bool,
    #[serde(default)]
    transparent: bool,
    #[serde(default)]
    tap_to_share: bool,
    #[serde(default)]
    required_features: Vec<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    launch_params: serde_json::Value,
    #[serde(default)]
    mime_types: Vec<MimeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MimeEntry {
    #[serde(rename_all = "camelCase")]
    Resource {
        mime: String,
        #[serde(default)]
        extension: Option<String>,
        #[serde(default)]
        stream: bool,
        #[serde(default)]
        verbs: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Redirect {
        url_pattern: String,
        #[serde(default)]
        verbs: BTreeMap<String, String>,
    },
    Scheme {
        scheme: String,
        #[serde(default)]
        verbs: BTreeMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
struct PackageDescriptor {
    id: Option<String>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    app: Vec<String>,
    #[serde(default)]
    services: Vec<String>,
    #[serde(default)]
    accounts: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// Candidate descriptor paths in preference order.
pub fn descriptor_candidates(folder: &Path, lang: &str, region: Option<&str>) -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(3);
    if !lang.is_empty() {
        let resources = folder.join("resources").join(lang);
        if let Some(region) = region {
            candidates.push(resources.join(region).join(APP_DESCRIPTOR));
        }
        candidates.push(resources.join(APP_DESCRIPTOR));
    }
    candidates.push(folder.join(APP_DESCRIPTOR));
    candidates
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> DescriptorResult<T> {
    let content = fs::read_to_string(path).map_err(|source| DescriptorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| DescriptorError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate the application living in `folder`.
pub fn load_application(folder: &Path, ctx: &LoadContext<'_>) -> DescriptorResult<Application> {
    let path = descriptor_candidates(folder, ctx.lang, ctx.region)
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| DescriptorError::NotFound {
            folder: folder.to_path_buf(),
        })?;

    let raw: AppDescriptor = read_json(&path)?;

    let id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| DescriptorError::MissingField {
            path: path.clone(),
            field: "id",
        })?;
    let title = raw
        .title
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| DescriptorError::MissingField {
            path: path.clone(),
            field: "title",
        })?;

    check_folder(&id, folder, ctx.folder_exceptions)?;

    let mut resource_registrations = Vec::new();
    let mut redirect_registrations = Vec::new();
    for entry in raw.mime_types {
        match entry {
            MimeEntry::Resource {
                mime,
                extension,
                stream,
                verbs,
            } => resource_registrations.push(ResourceRegistration {
                mime: mime.to_lowercase(),
                extension: extension.map(|e| e.trim_start_matches('.').to_lowercase()),
                should_download_first: !stream,
                verbs,
            }),
            MimeEntry::Redirect { url_pattern, verbs } => {
                redirect_registrations.push(RedirectRegistration {
                    pattern: url_pattern,
                    scheme_form: false,
                    verbs,
                })
            }
            MimeEntry::Scheme { scheme, verbs } => redirect_registrations.push(RedirectRegistration {
                pattern: format!("^{}:", regex::escape(&scheme.to_lowercase())),
                scheme_form: true,
                verbs,
            }),
        }
    }

    let mut app = Application {
        version: raw.version,
        kind: raw.kind,
        entry_point: raw.main,
        icon: raw.icon,
        category: raw.category,
        vendor: raw.vendor,
        vendor_url: raw.vendor_url,
        folder_path: folder.to_path_buf(),
        package_id: id.clone(),
        removable: raw.removable && !ctx.read_only,
        user_hideable: raw.user_hideable,
        visible: raw.visible,
        headless: raw.no_window,
        transparent: raw.transparent,
        tap_to_share: raw.tap_to_share,
        read_only: ctx.read_only,
        hardware_features: HardwareFeatures::from_names(&raw.required_features),
        size: raw.size,
        launch_params: raw.launch_params,
        resource_registrations,
        redirect_registrations,
        launch_points: Vec::new(),
        ..Application::new(&id, &title)
    };
    app.launch_points.push(LaunchPoint::default_for(&app));
    Ok(app)
}

/// The folder holding an app must be named after the app id, apart from a
/// short list of historical exceptions.
fn check_folder(id: &str, folder: &Path, exceptions: &[String]) -> DescriptorResult<()> {
    let folder_name = folder.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if folder_name == id || exceptions.iter().any(|e| e == id) {
        Ok(())
    } else {
        Err(DescriptorError::FolderMismatch {
            id: id.to_string(),
            folder: folder.to_path_buf(),
        })
    }
}

pub fn load_package(folder: &Path, read_only: bool) -> DescriptorResult<Package> {
    let path = folder.join(PACKAGE_DESCRIPTOR);
    if !path.is_file() {
        return Err(DescriptorError::NotFound {
            folder: folder.to_path_buf(),
        });
    }
    let raw: PackageDescriptor = read_json(&path)?;
    let id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| DescriptorError::MissingField {
            path: path.clone(),
            field: "id",
        })?;
    Ok(Package {
        id,
        version: raw.version,
        folder_path: Some(folder.to_path_buf()),
        app_ids: raw.app,
        service_ids: raw.services,
        account_ids: raw.accounts,
        installed_size: 0,
        block_size: 0,
        legacy: false,
        read_only,
    })
}

pub fn load_service(folder: &Path, package_id: &str) -> DescriptorResult<Service> {
    let path = folder.join(SERVICE_DESCRIPTOR);
    if !path.is_file() {
        return Err(DescriptorError::NotFound {
            folder: folder.to_path_buf(),
        });
    }
    let descriptor: serde_json::Value = read_json(&path)?;
    let id = folder
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| DescriptorError::MissingField {
            path: path.clone(),
            field: "id",
        })?;
    Ok(Service {
        id,
        package_id: package_id.to_string(),
        folder_path: folder.to_path_buf(),
        descriptor,
    })
}
