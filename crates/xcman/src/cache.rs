use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xcman_core::AppDescriptor;
use xcman_platform::AppPaths;

/// The last descriptor snapshot a check produced, so `status` and a failed
/// check still have something to show.
#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestCache {
    pub descriptors: Vec<AppDescriptor>,
    pub cached_at: DateTime<Utc>,
}

impl ManifestCache {
    pub fn new(descriptors: Vec<AppDescriptor>) -> Self {
        Self {
            descriptors,
            cached_at: Utc::now(),
        }
    }

    fn load_from_path(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(cache) => Some(cache),
            Err(error) => {
                log::debug!("Discarding manifest cache {}: {error}", path.display());
                None
            }
        }
    }

    fn save_to_path(&self, path: &Path) {
        let result = serde_json::to_vec(self)
            .map_err(std::io::Error::from)
            .and_then(|data| xcman_platform::write_atomic(path, &data));
        if let Err(error) = result {
            log::warn!("Failed to save manifest cache {}: {error}", path.display());
        }
    }

    pub fn load(paths: &AppPaths) -> Option<Self> {
        Self::load_from_path(&paths.manifest_cache_file())
    }

    pub fn save(&self, paths: &AppPaths) {
        self.save_to_path(&paths.manifest_cache_file());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use xcman_core::AppDescriptor;
    use xcman_core::packages::XCTRACK;

    use super::ManifestCache;

    fn sample_cache() -> ManifestCache {
        ManifestCache::new(vec![AppDescriptor {
            name: "XCTrack".to_string(),
            package_id: XCTRACK.to_string(),
            latest_version: "0.9.11.5".to_string(),
            apk_path: "apks/xctrack.apk".to_string(),
            compatible_models: BTreeSet::new(),
            min_platform_version: String::new(),
            installed_version: "0.9.11.4".to_string(),
            highest_server_version: "0.9.11.5".to_string(),
            resolved_download_name: "xctrack.apk".to_string(),
        }])
    }

    #[test]
    fn saved_snapshot_loads_back_with_local_fields() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("manifest.json");

        sample_cache().save_to_path(&path);
        let loaded = ManifestCache::load_from_path(&path).expect("cache should load");

        assert_eq!(loaded.descriptors.len(), 1);
        assert_eq!(loaded.descriptors[0].installed_version, "0.9.11.4");
        assert!(loaded.descriptors[0].is_outdated());
    }

    #[test]
    fn invalid_cache_is_ignored() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("manifest.json");
        std::fs::write(&path, "{not-valid-json").expect("invalid file should be written");

        assert!(ManifestCache::load_from_path(&path).is_none());
    }

    #[test]
    fn saving_replaces_previous_snapshot_without_leftovers() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("manifest.json");
        std::fs::write(&path, "{not-valid-json").expect("invalid file should be written");

        sample_cache().save_to_path(&path);

        assert!(ManifestCache::load_from_path(&path).is_some());
        let leftovers = std::fs::read_dir(temp_dir.path())
            .expect("read temp dir entries")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
