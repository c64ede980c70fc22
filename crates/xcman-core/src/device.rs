//! The device-side collaborators: who tells us what is installed, and who
//! hands finished downloads to the platform installer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::process::Command;
use which::which;
use xcman_platform::HideWindow;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("adb executable not found in PATH")]
    AdbNotFound,
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("could not read {what} from device output {output:?}")]
    Parse { what: &'static str, output: String },
}

#[async_trait]
pub trait PackageInfo: Send + Sync {
    /// Installed version name, or `None` when the package is absent.
    async fn installed_version(&self, package_id: &str) -> Option<String>;
    async fn platform_level(&self) -> Result<u32, DeviceError>;
    async fn device_model(&self) -> Result<String, DeviceError>;
}

/// Fire-and-forget hand-off to the platform installer. Callers do not learn
/// whether the install itself went through.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install_artifact(&self, path: &Path, package_id: &str) -> Result<(), DeviceError>;
}

/// A phone reachable over `adb`.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb: PathBuf,
    serial: Option<String>,
}

impl AdbDevice {
    #[must_use]
    pub fn new(adb: PathBuf, serial: Option<String>) -> Self {
        Self { adb, serial }
    }

    /// Use `adb_path` when given, otherwise look `adb` up on `PATH`.
    ///
    /// # Errors
    /// Returns [`DeviceError::AdbNotFound`] when no executable is found.
    pub fn detect(adb_path: Option<PathBuf>, serial: Option<String>) -> Result<Self, DeviceError> {
        let adb = match adb_path {
            Some(path) if path.exists() => path,
            Some(_) => return Err(DeviceError::AdbNotFound),
            None => which("adb").map_err(|_| DeviceError::AdbNotFound)?,
        };
        debug!("Using adb at {}", adb.display());
        Ok(Self::new(adb, serial))
    }

    fn command_line(&self, args: &[&str]) -> String {
        let mut line = self.adb.display().to_string();
        if let Some(serial) = &self.serial {
            line.push_str(" -s ");
            line.push_str(serial);
        }
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    async fn run(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut command = Command::new(&self.adb);
        command.hide_window();
        if let Some(serial) = &self.serial {
            command.arg("-s").arg(serial);
        }
        command.args(args);

        let output = command.output().await.map_err(|source| DeviceError::Spawn {
            command: self.command_line(args),
            source,
        })?;

        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                command: self.command_line(args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn getprop(&self, property: &str) -> Result<String, DeviceError> {
        self.run(&["shell", "getprop", property])
            .await
            .map(|output| output.trim().to_string())
    }
}

#[async_trait]
impl PackageInfo for AdbDevice {
    async fn installed_version(&self, package_id: &str) -> Option<String> {
        match self.run(&["shell", "dumpsys", "package", package_id]).await {
            Ok(output) => parse_version_name(&output),
            Err(error) => {
                debug!("Could not query {package_id}: {error}");
                None
            }
        }
    }

    async fn platform_level(&self) -> Result<u32, DeviceError> {
        let output = self.getprop("ro.build.version.sdk").await?;
        output.parse().map_err(|_| DeviceError::Parse {
            what: "platform level",
            output,
        })
    }

    async fn device_model(&self) -> Result<String, DeviceError> {
        let model = self.getprop("ro.product.model").await?;
        if model.is_empty() {
            return Err(DeviceError::Parse {
                what: "device model",
                output: model,
            });
        }
        Ok(model)
    }
}

#[async_trait]
impl Installer for AdbDevice {
    async fn install_artifact(&self, path: &Path, package_id: &str) -> Result<(), DeviceError> {
        info!("Installing {package_id} from {}", path.display());
        let path = path.to_string_lossy();
        self.run(&["install", "-r", path.as_ref()]).await?;
        Ok(())
    }
}

/// Pull `versionName=` out of `dumpsys package` output.
fn parse_version_name(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix("versionName=")?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{AdbDevice, DeviceError, parse_version_name};

    #[test]
    fn parse_version_name_reads_dumpsys_output() {
        let output = "\
Packages:
  Package [org.xcontest.XCTrack] (f00ba4):
    versionCode=9115 minSdk=24 targetSdk=34
    versionName=0.9.11.5
    splits=[base]
";
        assert_eq!(parse_version_name(output).as_deref(), Some("0.9.11.5"));
    }

    #[test]
    fn parse_version_name_is_none_for_missing_packages() {
        assert_eq!(parse_version_name("Unable to find package: x\n"), None);
        assert_eq!(parse_version_name("    versionName=\n"), None);
    }

    #[test]
    fn command_line_includes_serial() {
        let device = AdbDevice::new(PathBuf::from("adb"), Some("R58M123".to_string()));
        assert_eq!(
            device.command_line(&["install", "-r", "x.apk"]),
            "adb -s R58M123 install -r x.apk"
        );
    }

    #[test]
    fn detect_rejects_missing_explicit_path() {
        let result = AdbDevice::detect(Some(PathBuf::from("/nonexistent/adb")), None);
        assert!(matches!(result, Err(DeviceError::AdbNotFound)));
    }
}
