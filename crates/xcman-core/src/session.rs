use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::device::{DeviceError, PackageInfo};
use crate::download::{DownloadQueue, JobId};
use crate::manifest::{AppDescriptor, ManifestClient, ManifestError};
use crate::retry::RetryPolicy;
use crate::select::{DeviceProfile, VersionSelector};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("update check failed: {0}")]
    Fetch(#[from] ManifestError),
    #[error("could not read device details: {0}")]
    Device(#[from] DeviceError),
}

/// One orchestration session: owns the descriptor snapshot from the last
/// successful check and the user's upgrade selections.
///
/// Selections live in their own map keyed by package id. Fetched
/// descriptors are replaced wholesale and never edited in place.
pub struct UpdateSession {
    manifest: ManifestClient,
    device: Arc<dyn PackageInfo>,
    retry: RetryPolicy,
    selector: VersionSelector,
    model_override: Option<String>,
    descriptors: Vec<AppDescriptor>,
    selections: HashMap<String, bool>,
}

impl UpdateSession {
    #[must_use]
    pub fn new(
        manifest: ManifestClient,
        device: Arc<dyn PackageInfo>,
        selector: VersionSelector,
    ) -> Self {
        Self {
            manifest,
            device,
            retry: RetryPolicy::default(),
            selector,
            model_override: None,
            descriptors: Vec::new(),
            selections: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Filter manager builds for `model` instead of the detected model.
    #[must_use]
    pub fn with_model_override(mut self, model: Option<String>) -> Self {
        self.model_override = model;
        self
    }

    /// Seed the session with a previously saved snapshot.
    pub fn restore(&mut self, descriptors: Vec<AppDescriptor>) {
        debug!("Restored {} cached descriptors", descriptors.len());
        self.descriptors = descriptors;
        self.selections.clear();
    }

    #[must_use]
    pub fn descriptors(&self) -> &[AppDescriptor] {
        &self.descriptors
    }

    /// # Errors
    /// Returns an error when the device cannot report its model or level.
    pub async fn device_profile(&self) -> Result<DeviceProfile, SessionError> {
        let model = match &self.model_override {
            Some(model) => model.clone(),
            None => self.device.device_model().await?,
        };
        let platform_level = self.device.platform_level().await?;
        Ok(DeviceProfile {
            model,
            platform_level,
        })
    }

    /// Fetch, select and augment a fresh snapshot. On any failure the
    /// previous snapshot stays in place.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be fetched within the
    /// retry budget or the device cannot be queried.
    pub async fn check_for_updates(&mut self) -> Result<&[AppDescriptor], SessionError> {
        let raw = self.manifest.fetch_manifest_with_retry(&self.retry).await?;
        let supplementary = self.manifest.fetch_supplementary_version().await;
        let profile = self.device_profile().await?;

        let selected = VersionSelector::select(raw, &profile);
        let mut installed = HashMap::new();
        for descriptor in &selected {
            if let Some(version) = self.device.installed_version(&descriptor.package_id).await {
                installed.insert(descriptor.package_id.clone(), version);
            }
        }

        let descriptors = self
            .selector
            .augment(selected, &installed, supplementary.as_deref());
        self.selections
            .retain(|package_id, _| descriptors.iter().any(|d| &d.package_id == package_id));
        self.descriptors = descriptors;

        info!(
            "Update check found {} apps, {} outdated",
            self.descriptors.len(),
            self.outdated().len()
        );
        Ok(&self.descriptors)
    }

    #[must_use]
    pub fn outdated(&self) -> Vec<&AppDescriptor> {
        self.descriptors.iter().filter(|d| d.is_outdated()).collect()
    }

    /// Record the user's upgrade intent. Returns `false` for a package the
    /// current snapshot does not know.
    pub fn set_selected(&mut self, package_id: &str, selected: bool) -> bool {
        if !self.descriptors.iter().any(|d| d.package_id == package_id) {
            return false;
        }
        self.selections.insert(package_id.to_string(), selected);
        true
    }

    /// Explicit choice if one was made, otherwise "selected when outdated".
    #[must_use]
    pub fn is_selected(&self, package_id: &str) -> bool {
        self.selections.get(package_id).copied().unwrap_or_else(|| {
            self.descriptors
                .iter()
                .any(|d| d.package_id == package_id && d.is_outdated())
        })
    }

    #[must_use]
    pub fn selected(&self) -> Vec<&AppDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| self.is_selected(&d.package_id))
            .collect()
    }

    /// Queue every selected descriptor in snapshot order.
    pub fn enqueue_selected(&self, queue: &mut DownloadQueue) -> Vec<JobId> {
        self.selected()
            .into_iter()
            .map(|descriptor| queue.enqueue(descriptor))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::{SessionError, UpdateSession};
    use crate::device::{DeviceError, PackageInfo};
    use crate::manifest::{AppDescriptor, ManifestClient, ManifestEndpoints, ManifestError};
    use crate::packages::{MANAGER, XCTRACK};
    use crate::retry::RetryPolicy;
    use crate::select::VersionSelector;

    struct FakeDevice {
        model: &'static str,
        level: u32,
        installed: HashMap<&'static str, &'static str>,
    }

    #[async_trait]
    impl PackageInfo for FakeDevice {
        async fn installed_version(&self, package_id: &str) -> Option<String> {
            self.installed.get(package_id).map(ToString::to_string)
        }

        async fn platform_level(&self) -> Result<u32, DeviceError> {
            Ok(self.level)
        }

        async fn device_model(&self) -> Result<String, DeviceError> {
            Ok(self.model.to_string())
        }
    }

    fn descriptor(package_id: &str, installed: &str, latest: &str) -> AppDescriptor {
        AppDescriptor {
            name: package_id.to_string(),
            package_id: package_id.to_string(),
            latest_version: latest.to_string(),
            apk_path: format!("{package_id}.apk"),
            compatible_models: BTreeSet::new(),
            min_platform_version: String::new(),
            installed_version: installed.to_string(),
            highest_server_version: latest.to_string(),
            resolved_download_name: format!("{package_id}.apk"),
        }
    }

    fn unreachable_session() -> UpdateSession {
        let endpoints = ManifestEndpoints {
            manifest_url: "http://127.0.0.1:9/versions.json".to_string(),
            supplementary_url: "http://127.0.0.1:9/version.txt".to_string(),
        };
        let client = ManifestClient::with_timeout(endpoints, Duration::from_millis(200))
            .expect("client should build");
        let device = FakeDevice {
            model: "SM-S901B",
            level: 34,
            installed: HashMap::new(),
        };
        UpdateSession::new(client, Arc::new(device), VersionSelector::new("https://alt/"))
            .with_retry(RetryPolicy::new(2, Duration::ZERO))
    }

    #[test]
    fn outdated_apps_are_selected_by_default() {
        let mut session = unreachable_session();
        session.restore(vec![
            descriptor(XCTRACK, "0.9.11.4", "0.9.11.5"),
            descriptor(MANAGER, "1.4", "1.4"),
        ]);

        assert!(session.is_selected(XCTRACK));
        assert!(!session.is_selected(MANAGER));
        assert_eq!(session.outdated().len(), 1);
    }

    #[test]
    fn explicit_selection_overrides_default() {
        let mut session = unreachable_session();
        session.restore(vec![
            descriptor(XCTRACK, "0.9.11.4", "0.9.11.5"),
            descriptor(MANAGER, "1.4", "1.4"),
        ]);

        assert!(session.set_selected(XCTRACK, false));
        assert!(session.set_selected(MANAGER, true));
        assert!(!session.set_selected("org.example.unknown", true));

        let selected: Vec<_> = session
            .selected()
            .into_iter()
            .map(|d| d.package_id.as_str())
            .collect();
        assert_eq!(selected, vec![MANAGER]);
        // Selections never touch the snapshot itself.
        assert_eq!(session.descriptors()[0].installed_version, "0.9.11.4");
    }

    #[tokio::test]
    async fn failed_check_keeps_previous_snapshot() {
        let mut session = unreachable_session();
        let cached = vec![descriptor(XCTRACK, "0.9.11.4", "0.9.11.5")];
        session.restore(cached.clone());

        let result = session.check_for_updates().await;

        assert!(matches!(
            result,
            Err(SessionError::Fetch(ManifestError::Request { .. }))
        ));
        assert_eq!(session.descriptors(), cached.as_slice());
    }

    #[tokio::test]
    async fn check_uses_model_override_for_manager_builds() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr");
        let body = r#"{"apps":[
            {"name":"XC Manager","package":"app.xcman.manager","latestVersion":"1.4",
             "apkPath":"manager/xcman-tab.apk","compatibleModels":["SM-X200"],
             "minAndroidVersion":"12"},
            {"name":"XC Manager","package":"app.xcman.manager","latestVersion":"1.5",
             "apkPath":"manager/xcman-phone.apk","compatibleModels":["SM-S901B"],
             "minAndroidVersion":"12"}
        ]}"#;
        tokio::spawn(async move {
            // Manifest request, then the supplementary request.
            for response_body in [body, ""] {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buffer = [0u8; 2048];
                let _ = socket.read(&mut buffer).await;
                let status = if response_body.is_empty() {
                    "404 Not Found"
                } else {
                    "200 OK"
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
                    response_body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        let endpoints = ManifestEndpoints {
            manifest_url: format!("http://{addr}/versions.json"),
            supplementary_url: format!("http://{addr}/version.txt"),
        };
        let device = FakeDevice {
            model: "SM-S901B",
            level: 34,
            installed: HashMap::from([(MANAGER, "1.3")]),
        };
        let mut session = UpdateSession::new(
            ManifestClient::new(endpoints).expect("client should build"),
            Arc::new(device),
            VersionSelector::new("https://alt/"),
        )
        .with_model_override(Some("SM-X200".to_string()));

        let descriptors = session
            .check_for_updates()
            .await
            .expect("check should succeed");

        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].apk_path, "manager/xcman-tab.apk");
        assert_eq!(descriptors[0].installed_version, "1.3");
        assert_eq!(descriptors[0].resolved_download_name, "xcman-tab.apk");
        assert!(session.is_selected(MANAGER));
    }
}
