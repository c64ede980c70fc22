//! The fixed set of companion apps this manager knows about.

/// XCTrack flight instrument. Versions look like `0.9.11.5-beta`.
pub const XCTRACK: &str = "org.xcontest.XCTrack";

/// XCGuide. Versions are effectively a single build number.
pub const XCGUIDE: &str = "indysoft.xcguide";

/// The manager app itself, published in several per-model builds.
pub const MANAGER: &str = "app.xcman.manager";

/// Placeholder stored for apps the device does not have installed.
pub const NOT_INSTALLED: &str = "N/A";

const NOT_INSTALLED_SENTINELS: [&str; 2] = [NOT_INSTALLED, "Not installed"];

/// Whether an installed-version string means "nothing installed".
#[must_use]
pub fn is_not_installed(version: &str) -> bool {
    let version = version.trim();
    version.is_empty()
        || NOT_INSTALLED_SENTINELS
            .iter()
            .any(|sentinel| version.eq_ignore_ascii_case(sentinel))
}
