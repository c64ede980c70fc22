use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xcman_core::{ManifestEndpoints, RetryPolicy};
use xcman_platform::AppPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,

    #[serde(default = "default_supplementary_url")]
    pub supplementary_url: String,

    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,

    #[serde(default = "default_xcguide_alternate_url")]
    pub xcguide_alternate_url: String,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    #[serde(default)]
    pub adb_path: Option<PathBuf>,

    #[serde(default)]
    pub device_serial: Option<String>,

    #[serde(default)]
    pub update_behavior: UpdateBehavior,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

/// What a scheduled check does once it finds outdated apps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateBehavior {
    DoNotCheck,
    #[default]
    Notify,
    AutomaticallyUpdate,
}

fn default_manifest_url() -> String {
    "https://updates.xcman.app/versions.json".to_string()
}

fn default_supplementary_url() -> String {
    "https://xcguide.app/version.txt".to_string()
}

fn default_download_base_url() -> String {
    "https://updates.xcman.app/".to_string()
}

fn default_xcguide_alternate_url() -> String {
    "https://xcguide.app/XCGuide.apk".to_string()
}

fn default_http_timeout() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            supplementary_url: default_supplementary_url(),
            download_base_url: default_download_base_url(),
            xcguide_alternate_url: default_xcguide_alternate_url(),
            http_timeout_secs: default_http_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            download_dir: None,
            adb_path: None,
            device_serial: None,
            update_behavior: UpdateBehavior::default(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl AppSettings {
    pub fn load(paths: &AppPaths) -> Self {
        Self::load_from(&paths.settings_file())
    }

    /// Missing or unreadable files yield the defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!(
                    "Ignoring unreadable settings at {}: {error}",
                    path.display()
                );
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, paths: &AppPaths) -> Result<(), std::io::Error> {
        self.save_to(&paths.settings_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_vec_pretty(self)?;
        xcman_platform::write_atomic(path, &content)
    }

    pub fn endpoints(&self) -> ManifestEndpoints {
        ManifestEndpoints {
            manifest_url: self.manifest_url.clone(),
            supplementary_url: self.supplementary_url.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_secs(self.retry_delay_secs),
        )
    }

    pub fn download_dir(&self, paths: &AppPaths) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| paths.downloads_dir())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{AppSettings, UpdateBehavior};

    #[test]
    fn defaults_match_published_endpoints_and_budgets() {
        let settings = AppSettings::default();

        assert_eq!(
            settings.manifest_url,
            "https://updates.xcman.app/versions.json"
        );
        assert_eq!(settings.http_timeout(), Duration::from_secs(5));
        let retry = settings.retry_policy();
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.delay, Duration::from_secs(2));
        assert_eq!(settings.update_behavior, UpdateBehavior::Notify);
        assert_eq!(settings.max_log_size_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn partial_settings_fill_in_defaults_and_ignore_unknown_fields() {
        let settings: AppSettings = serde_json::from_value(json!({
            "retry_attempts": 5,
            "update_behavior": "AutomaticallyUpdate",
            "theme": "Dark"
        }))
        .expect("partial settings should deserialize");

        assert_eq!(settings.retry_attempts, 5);
        assert_eq!(settings.update_behavior, UpdateBehavior::AutomaticallyUpdate);
        assert_eq!(settings.retry_delay_secs, 2);
        assert!(settings.adb_path.is_none());
    }

    #[test]
    fn corrupt_settings_file_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("settings file should be written");

        assert_eq!(AppSettings::load_from(&path), AppSettings::default());
        assert_eq!(
            AppSettings::load_from(&temp_dir.path().join("missing.json")),
            AppSettings::default()
        );
    }

    #[test]
    fn saved_settings_load_back() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("config").join("settings.json");
        let settings = AppSettings {
            device_serial: Some("R58M123".to_string()),
            debug_logging: true,
            ..AppSettings::default()
        };

        settings.save_to(&path).expect("settings should save");

        assert_eq!(AppSettings::load_from(&path), settings);
    }

    #[test]
    fn zero_timeout_is_raised_to_one_second() {
        let settings = AppSettings {
            http_timeout_secs: 0,
            ..AppSettings::default()
        };
        assert_eq!(settings.http_timeout(), Duration::from_secs(1));
    }
}
