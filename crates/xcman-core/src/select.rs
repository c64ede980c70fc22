use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};

use crate::compare::{ParseRule, is_server_version_higher};
use crate::manifest::AppDescriptor;
use crate::packages::{self, NOT_INSTALLED};

/// Display name whose build is always saved under [`SHORT_NAME_FILE`].
pub const SHORT_NAME_SENTINEL: &str = "XCTrack (beta)";
pub const SHORT_NAME_FILE: &str = "xctrack-beta.apk";

const PLATFORM_LEVELS: [(&str, u32); 23] = [
    ("4.4", 19),
    ("5.0", 21),
    ("5.1", 22),
    ("6.0", 23),
    ("7.0", 24),
    ("7.1", 25),
    ("8.0", 26),
    ("8.1", 27),
    ("9", 28),
    ("9.0", 28),
    ("10", 29),
    ("10.0", 29),
    ("11", 30),
    ("11.0", 30),
    ("12", 31),
    ("12.0", 31),
    ("12L", 32),
    ("13", 33),
    ("13.0", 33),
    ("14", 34),
    ("14.0", 34),
    ("15", 35),
    ("16", 36),
];

/// Map an Android release string from the manifest to its API level.
/// Unknown strings map to 0 so they never exclude a build.
#[must_use]
pub fn platform_level(release: &str) -> u32 {
    let release = release.trim();
    PLATFORM_LEVELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(release))
        .map_or(0, |(_, level)| *level)
}

/// What the selector needs to know about the target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub model: String,
    pub platform_level: u32,
}

/// Reduces a raw manifest to one descriptor per package and fills in the
/// locally derived fields.
#[derive(Debug, Clone)]
pub struct VersionSelector {
    xcguide_alternate_url: String,
}

impl VersionSelector {
    #[must_use]
    pub fn new(xcguide_alternate_url: impl Into<String>) -> Self {
        Self {
            xcguide_alternate_url: xcguide_alternate_url.into(),
        }
    }

    /// Keep the best candidate per package, in order of first appearance.
    ///
    /// Manager builds must list the device model and must not require a
    /// newer platform than the device runs; a manager with no surviving
    /// build is left out entirely.
    #[must_use]
    pub fn select(raw: Vec<AppDescriptor>, device: &DeviceProfile) -> Vec<AppDescriptor> {
        let mut selected: Vec<AppDescriptor> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for candidate in raw {
            if candidate.package_id == packages::MANAGER && !is_compatible(&candidate, device) {
                debug!(
                    "Skipping {} {}: not built for {} / API {}",
                    candidate.package_id,
                    candidate.latest_version,
                    device.model,
                    device.platform_level
                );
                continue;
            }

            match positions.get(&candidate.package_id) {
                Some(&index) => {
                    let rule = ParseRule::for_package(&candidate.package_id);
                    let current = &selected[index];
                    if rule.compare(&candidate.latest_version, &current.latest_version)
                        == Ordering::Greater
                    {
                        selected[index] = candidate;
                    }
                }
                None => {
                    positions.insert(candidate.package_id.clone(), selected.len());
                    selected.push(candidate);
                }
            }
        }

        selected
    }

    /// Attach installed versions, apply the supplementary XCGuide version
    /// when it beats the manifest, and resolve download file names.
    #[must_use]
    pub fn augment(
        &self,
        selected: Vec<AppDescriptor>,
        installed: &HashMap<String, String>,
        supplementary_version: Option<&str>,
    ) -> Vec<AppDescriptor> {
        selected
            .into_iter()
            .map(|descriptor| {
                let mut descriptor = AppDescriptor {
                    installed_version: installed
                        .get(&descriptor.package_id)
                        .cloned()
                        .unwrap_or_else(|| NOT_INSTALLED.to_string()),
                    highest_server_version: descriptor.latest_version.clone(),
                    ..descriptor
                };

                if descriptor.package_id == packages::XCGUIDE
                    && let Some(version) = supplementary_version
                    && is_server_version_higher(
                        &descriptor.highest_server_version,
                        version,
                        packages::XCGUIDE,
                    )
                {
                    info!(
                        "XCGuide {version} is newer than manifest {}",
                        descriptor.highest_server_version
                    );
                    descriptor.highest_server_version = version.to_string();
                    descriptor.apk_path.clone_from(&self.xcguide_alternate_url);
                    descriptor.name = format!("XCGuide {version}");
                }

                descriptor.resolved_download_name = resolve_download_name(&descriptor);
                descriptor
            })
            .collect()
    }
}

fn is_compatible(descriptor: &AppDescriptor, device: &DeviceProfile) -> bool {
    descriptor.compatible_models.contains(&device.model)
        && platform_level(&descriptor.min_platform_version) <= device.platform_level
}

/// File name a descriptor's artifact should end up under on disk.
#[must_use]
pub fn resolve_download_name(descriptor: &AppDescriptor) -> String {
    let name = if descriptor.package_id == packages::MANAGER {
        original_file_name(&descriptor.apk_path)
    } else if descriptor.name == SHORT_NAME_SENTINEL {
        SHORT_NAME_FILE.to_string()
    } else if descriptor.package_id == packages::XCGUIDE
        && !Path::new(&descriptor.apk_path).has_root()
    {
        format!("{}.apk", descriptor.name)
    } else {
        base_name(&descriptor.apk_path).to_string()
    };

    let name = sanitize_file_name(&name);
    if name.is_empty() {
        format!("{}.apk", descriptor.package_id)
    } else {
        name
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn original_file_name(apk_path: &str) -> String {
    let without_suffix = apk_path
        .split(['?', '#'])
        .next()
        .unwrap_or(apk_path);
    base_name(without_suffix).to_string()
}

fn sanitize_file_name(name: &str) -> String {
    let name = name.trim().replace(['/', '\\', ':'], "_");
    if name == "." || name == ".." {
        String::new()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use super::{DeviceProfile, VersionSelector, platform_level, resolve_download_name};
    use crate::manifest::AppDescriptor;
    use crate::packages::{MANAGER, XCGUIDE, XCTRACK};

    const ALTERNATE_URL: &str = "https://xcguide.app/XCGuide.apk";

    fn descriptor(package_id: &str, version: &str) -> AppDescriptor {
        AppDescriptor {
            name: package_id.to_string(),
            package_id: package_id.to_string(),
            latest_version: version.to_string(),
            apk_path: format!("apks/{package_id}-{version}.apk"),
            compatible_models: BTreeSet::new(),
            min_platform_version: String::new(),
            installed_version: "N/A".to_string(),
            highest_server_version: version.to_string(),
            resolved_download_name: String::new(),
        }
    }

    fn manager(version: &str, models: &[&str], min_platform: &str) -> AppDescriptor {
        AppDescriptor {
            compatible_models: models.iter().map(ToString::to_string).collect(),
            min_platform_version: min_platform.to_string(),
            ..descriptor(MANAGER, version)
        }
    }

    fn device() -> DeviceProfile {
        DeviceProfile {
            model: "SM-S901B".to_string(),
            platform_level: 33,
        }
    }

    fn selector() -> VersionSelector {
        VersionSelector::new(ALTERNATE_URL)
    }

    #[test]
    fn platform_level_maps_known_releases_and_defaults_to_zero() {
        assert_eq!(platform_level("13"), 33);
        assert_eq!(platform_level("8.1"), 27);
        assert_eq!(platform_level("12l"), 32);
        assert_eq!(platform_level(" 10.0 "), 29);
        assert_eq!(platform_level("Tiramisu"), 0);
        assert_eq!(platform_level(""), 0);
    }

    #[test]
    fn select_keeps_highest_compatible_manager_build() {
        let raw = vec![
            manager("1.0", &["SM-S901B"], "12"),
            manager("1.1", &["SM-S901B"], "12"),
        ];

        let selected = VersionSelector::select(raw, &device());

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].latest_version, "1.1");
    }

    #[test]
    fn select_excludes_manager_builds_requiring_newer_platform() {
        let raw = vec![
            manager("1.0", &["SM-S901B"], "12"),
            manager("2.0", &["SM-S901B"], "14"),
        ];

        let selected = VersionSelector::select(raw, &device());

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].latest_version, "1.0");
    }

    #[test]
    fn select_omits_manager_when_no_build_matches_the_model() {
        let raw = vec![
            manager("1.0", &["Pixel 8"], "12"),
            descriptor(XCTRACK, "0.9.11"),
        ];

        let selected = VersionSelector::select(raw, &device());

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].package_id, XCTRACK);
    }

    #[test]
    fn select_passes_other_packages_through_without_model_filtering() {
        let raw = vec![descriptor(XCTRACK, "0.9.11"), descriptor(XCGUIDE, "203")];

        let selected = VersionSelector::select(raw.clone(), &device());

        assert_eq!(selected, raw);
    }

    #[test]
    fn select_resolves_duplicate_other_packages_by_their_own_rule() {
        let raw = vec![
            descriptor(XCTRACK, "0.9.9"),
            descriptor(XCGUIDE, "203"),
            descriptor(XCTRACK, "0.9.11-2"),
            descriptor(XCTRACK, "0.9.10"),
        ];

        let selected = VersionSelector::select(raw, &device());

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].package_id, XCTRACK);
        assert_eq!(selected[0].latest_version, "0.9.11-2");
        assert_eq!(selected[1].package_id, XCGUIDE);
    }

    #[test]
    fn augment_fills_installed_versions_and_download_names() {
        let installed = HashMap::from([(XCTRACK.to_string(), "0.9.10".to_string())]);
        let selected = vec![descriptor(XCTRACK, "0.9.11"), descriptor(XCGUIDE, "203")];

        let augmented = selector().augment(selected, &installed, None);

        assert_eq!(augmented[0].installed_version, "0.9.10");
        assert_eq!(augmented[0].highest_server_version, "0.9.11");
        assert_eq!(
            augmented[0].resolved_download_name,
            "org.xcontest.XCTrack-0.9.11.apk"
        );
        assert!(augmented[0].is_outdated());
        assert_eq!(augmented[1].installed_version, "N/A");
        assert_eq!(augmented[1].resolved_download_name, "indysoft.xcguide.apk");
    }

    #[test]
    fn augment_applies_newer_supplementary_xcguide_version() {
        let installed = HashMap::from([(XCGUIDE.to_string(), "203".to_string())]);
        let selected = vec![descriptor(XCGUIDE, "203")];

        let augmented = selector().augment(selected, &installed, Some("205"));

        let xcguide = &augmented[0];
        assert_eq!(xcguide.highest_server_version, "205");
        assert_eq!(xcguide.latest_version, "203");
        assert_eq!(xcguide.apk_path, ALTERNATE_URL);
        assert_eq!(xcguide.name, "XCGuide 205");
        assert_eq!(xcguide.resolved_download_name, "XCGuide 205.apk");
        assert!(xcguide.is_outdated());
    }

    #[test]
    fn augment_ignores_older_or_equal_supplementary_version() {
        let selected = vec![descriptor(XCGUIDE, "205")];

        for version in ["204", "205"] {
            let augmented = selector().augment(selected.clone(), &HashMap::new(), Some(version));
            assert_eq!(augmented[0].highest_server_version, "205");
            assert_eq!(augmented[0].apk_path, "apks/indysoft.xcguide-205.apk");
        }
    }

    #[test]
    fn download_name_uses_original_manager_file_name() {
        let mut manager = manager("1.4", &["SM-S901B"], "12");
        manager.apk_path = "https://cdn.example.com/m/xcman-1.4-s22.apk?token=abc".to_string();

        assert_eq!(resolve_download_name(&manager), "xcman-1.4-s22.apk");
    }

    #[test]
    fn download_name_uses_short_file_for_sentinel_display_name() {
        let mut beta = descriptor(XCTRACK, "0.9.12");
        beta.name = "XCTrack (beta)".to_string();

        assert_eq!(resolve_download_name(&beta), "xctrack-beta.apk");
    }

    #[test]
    fn download_name_for_rooted_xcguide_path_is_its_base_name() {
        let mut xcguide = descriptor(XCGUIDE, "203");
        xcguide.apk_path = "/files/xcguide-203.apk".to_string();

        assert_eq!(resolve_download_name(&xcguide), "xcguide-203.apk");
    }

    #[test]
    fn download_name_never_contains_path_separators() {
        let mut xcguide = descriptor(XCGUIDE, "203");
        xcguide.name = "XC/Guide".to_string();

        assert_eq!(resolve_download_name(&xcguide), "XC_Guide.apk");

        let mut bare = descriptor(XCTRACK, "1");
        bare.apk_path = "downloads/".to_string();
        assert_eq!(resolve_download_name(&bare), "org.xcontest.XCTrack.apk");
    }
}
