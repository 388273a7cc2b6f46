use serde::{Deserialize, Serialize};

use super::Application;

/// A named, parameterized entry into an application.
///
/// Every application has exactly one default launch point, created when the
/// application is registered. Additional ones are created on request and
/// persisted one file per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchPoint {
    pub id: String,
    pub app_id: String,
    pub title: String,
    #[serde(default)]
    pub menu_name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub default: bool,
}

impl LaunchPoint {
    pub fn default_id(app_id: &str) -> String {
        format!("{}_default", app_id)
    }

    pub fn default_for(app: &Application) -> Self {
        Self {
            id: Self::default_id(&app.id),
            app_id: app.id.clone(),
            title: app.title.clone(),
            menu_name: app.title.clone(),
            icon: app.icon.clone(),
            params: app.launch_params.clone(),
            removable: app.removable,
            default: true,
        }
    }

    pub fn dynamic(
        id: String,
        app_id: &str,
        title: &str,
        icon: &str,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id,
            app_id: app_id.to_string(),
            title: title.to_string(),
            menu_name: title.to_string(),
            icon: icon.to_string(),
            params,
            removable: true,
            default: false,
        }
    }
}
