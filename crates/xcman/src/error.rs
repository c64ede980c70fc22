use thiserror::Error;
use xcman_core::schedule::TriggerError;
use xcman_core::{DeviceError, ManifestError, ScheduleError, SessionError, StoreError};
use xcman_platform::AppPathsError;

use crate::single_instance::AcquireError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Paths(#[from] AppPathsError),
    #[error(transparent)]
    Instance(#[from] AcquireError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown package {0}; run `xcman check` to list packages")]
    UnknownPackage(String),
    #[error("an update check is already running")]
    CheckInProgress,
}

impl AppError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}
