//! Update orchestration engine for xcman.
//!
//! This crate holds everything that decides what to update and when,
//! independent of the CLI and of how the device is reached:
//! - Package-specific version comparison.
//! - Manifest fetching with a fixed retry budget.
//! - Per-device build selection and download file naming.
//! - A strictly sequential download queue.
//! - Persisted recheck scheduling.

pub mod compare;
pub mod device;
pub mod download;
pub mod manifest;
pub mod packages;
pub mod retry;
pub mod schedule;
pub mod select;
pub mod session;
pub mod store;

/// Version comparison strategy table and the "is there an update" check.
pub use compare::{ParseRule, is_server_version_higher};
/// Device-side collaborators and the `adb` implementation.
pub use device::{AdbDevice, DeviceError, Installer, PackageInfo};
/// Sequential download queue and its HTTP downloader.
pub use download::{
    DownloadError, DownloadJob, DownloadQueue, Downloader, DrainSummary, HttpDownloader,
    JobCompleted, QueueEvent,
};
/// Manifest model and client.
pub use manifest::{AppDescriptor, ManifestClient, ManifestEndpoints, ManifestError};
pub use retry::RetryPolicy;
/// Recheck state machine, its persisted keys and periodic triggers.
pub use schedule::{
    CheckInterval, PeriodicTrigger, ScheduleError, SchedulePhase, ScheduleStore, Scheduler,
    TokioTrigger,
};
pub use select::{DeviceProfile, VersionSelector};
pub use session::{SessionError, UpdateSession};
/// Typed key/value persistence.
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoreError, StoreValue};
