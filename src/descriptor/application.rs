use std::{collections::BTreeMap, path::PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::LaunchPoint;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AppKind {
    #[default]
    Web,
    Native,
    NativeBuiltin,
    Pdk,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
pub enum AppStatus {
    #[default]
    Ready,
    Installing,
    Updating,
    Failed,
}

bitflags! {
    /// Hardware an application declares it needs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HardwareFeatures: u32 {
        const CAMERA = 1 << 0;
        const GPS = 1 << 1;
        const WIFI = 1 << 2;
        const BLUETOOTH = 1 << 3;
        const TELEPHONY = 1 << 4;
        const ACCELEROMETER = 1 << 5;
        const COMPASS = 1 << 6;
        const KEYBOARD = 1 << 7;
    }
}

impl HardwareFeatures {
    /// Unknown names are ignored.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| match name.as_ref().to_lowercase().as_str() {
                "camera" => Some(Self::CAMERA),
                "gps" => Some(Self::GPS),
                "wifi" => Some(Self::WIFI),
                "bluetooth" => Some(Self::BLUETOOTH),
                "telephony" | "phone" => Some(Self::TELEPHONY),
                "accelerometer" => Some(Self::ACCELEROMETER),
                "compass" => Some(Self::COMPASS),
                "keyboard" => Some(Self::KEYBOARD),
                _ => None,
            })
            .fold(Self::empty(), |acc, f| acc | f)
    }
}

/// A content-type keyed registration: "this app opens `mime`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRegistration {
    pub mime: String,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub should_download_first: bool,
    #[serde(default)]
    pub verbs: BTreeMap<String, String>,
}

/// A URL-pattern keyed registration. Scheme registrations are stored as the
/// anchored pattern `^scheme:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectRegistration {
    pub pattern: String,
    #[serde(default)]
    pub scheme_form: bool,
    #[serde(default)]
    pub verbs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub version: String,
    pub kind: AppKind,
    pub title: String,
    pub entry_point: String,
    pub icon: String,
    pub category: String,
    pub vendor: String,
    pub vendor_url: String,
    pub folder_path: PathBuf,
    pub package_id: String,
    pub removable: bool,
    pub user_hideable: bool,
    pub visible: bool,
    pub headless: bool,
    pub transparent: bool,
    pub tap_to_share: bool,
    /// Lives on a read-only root and can only be shallow-removed
    pub read_only: bool,
    pub hardware_features: HardwareFeatures,
    /// Declared footprint in KB
    pub size: u64,
    pub launch_params: serde_json::Value,
    pub resource_registrations: Vec<ResourceRegistration>,
    pub redirect_registrations: Vec<RedirectRegistration>,
    pub launch_points: Vec<LaunchPoint>,

    // Volatile state, never part of a strict compare
    pub status: AppStatus,
    pub progress: u32,
    pub execution_locked: bool,
    pub marked_for_removal: bool,
    pub generation: u64,
}

/// What [`Application::merge_from`] changed beyond plain fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub default_launch_point_changed: bool,
    pub registrations_changed: bool,
}

impl Application {
    pub fn new(id: &str, title: &str) -> Self {
        let mut app = Self {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            kind: AppKind::default(),
            title: title.to_string(),
            entry_point: "index.html".to_string(),
            icon: String::new(),
            category: String::new(),
            vendor: String::new(),
            vendor_url: String::new(),
            folder_path: PathBuf::new(),
            package_id: id.to_string(),
            removable: true,
            user_hideable: false,
            visible: true,
            headless: false,
            transparent: false,
            tap_to_share: false,
            read_only: false,
            hardware_features: HardwareFeatures::empty(),
            size: 0,
            launch_params: serde_json::Value::Null,
            resource_registrations: Vec::new(),
            redirect_registrations: Vec::new(),
            launch_points: Vec::new(),
            status: AppStatus::Ready,
            progress: 0,
            execution_locked: false,
            marked_for_removal: false,
            generation: 0,
        };
        app.launch_points.push(LaunchPoint::default_for(&app));
        app
    }

    /// Field comparison used by the reconciler to decide whether an on-disk
    /// record differs from the registered one. Volatile state (status,
    /// progress, execution lock, removal mark, generation) and launch points
    /// are excluded. The version only counts for removable apps.
    pub fn strict_eq(&self, other: &Application) -> bool {
        self.id == other.id
            && self.category == other.category
            && self.entry_point == other.entry_point
            && (!self.removable || self.version == other.version)
            && self.removable == other.removable
            && self.resource_registrations == other.resource_registrations
            && self.redirect_registrations == other.redirect_registrations
            && self.folder_path == other.folder_path
            && self.vendor == other.vendor
            && self.vendor_url == other.vendor_url
            && self.headless == other.headless
            && self.transparent == other.transparent
            && self.visible == other.visible
            && self.size == other.size
            && self.tap_to_share == other.tap_to_share
    }

    /// Copy every descriptor field of `incoming` into `self`, keeping the
    /// identity (id, launch point list, volatile state) of the stored record.
    pub fn merge_from(&mut self, incoming: &Application) -> MergeOutcome {
        let registrations_changed = self.resource_registrations
            != incoming.resource_registrations
            || self.redirect_registrations != incoming.redirect_registrations;

        self.version = incoming.version.clone();
        self.kind = incoming.kind;
        self.title = incoming.title.clone();
        self.entry_point = incoming.entry_point.clone();
        self.icon = incoming.icon.clone();
        self.category = incoming.category.clone();
        self.vendor = incoming.vendor.clone();
        self.vendor_url = incoming.vendor_url.clone();
        self.folder_path = incoming.folder_path.clone();
        self.package_id = incoming.package_id.clone();
        self.removable = incoming.removable;
        self.user_hideable = incoming.user_hideable;
        self.visible = incoming.visible;
        self.headless = incoming.headless;
        self.transparent = incoming.transparent;
        self.tap_to_share = incoming.tap_to_share;
        self.read_only = incoming.read_only;
        self.hardware_features = incoming.hardware_features;
        self.size = incoming.size;
        self.launch_params = incoming.launch_params.clone();
        self.resource_registrations = incoming.resource_registrations.clone();
        self.redirect_registrations = incoming.redirect_registrations.clone();

        let mut default_launch_point_changed = false;
        let (title, icon) = (self.title.clone(), self.icon.clone());
        if let Some(lp) = self.default_launch_point_mut() {
            if lp.title != title || lp.icon != icon {
                lp.title = title.clone();
                lp.menu_name = title;
                lp.icon = icon;
                default_launch_point_changed = true;
            }
        }

        self.generation += 1;
        MergeOutcome {
            default_launch_point_changed,
            registrations_changed,
        }
    }

    pub fn default_launch_point(&self) -> Option<&LaunchPoint> {
        self.launch_points.iter().find(|lp| lp.default)
    }

    fn default_launch_point_mut(&mut self) -> Option<&mut LaunchPoint> {
        self.launch_points.iter_mut().find(|lp| lp.default)
    }

    pub fn launch_point(&self, id: &str) -> Option<&LaunchPoint> {
        self.launch_points.iter().find(|lp| lp.id == id)
    }

    /// Attach a dynamic launch point. A second default is refused.
    pub fn attach_launch_point(&mut self, launch_point: LaunchPoint) -> bool {
        if launch_point.default || self.launch_point(&launch_point.id).is_some() {
            return false;
        }
        self.launch_points.push(launch_point);
        true
    }

    pub fn detach_launch_point(&mut self, id: &str) -> Option<LaunchPoint> {
        let pos = self
            .launch_points
            .iter()
            .position(|lp| lp.id == id && !lp.default)?;
        Some(self.launch_points.remove(pos))
    }
}
