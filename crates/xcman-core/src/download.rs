//! Strictly sequential download queue.
//!
//! One job is in flight at a time. Each job reports back over a channel as
//! a [`JobCompleted`] message, and only that message advances the queue.
//! Failed jobs are dropped, never retried.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::Installer;
use crate::manifest::AppDescriptor;
use crate::packages;
use crate::select::resolve_download_name;

pub type JobId = u64;

/// A descriptor snapshot queued for download. Owns its copy of the
/// descriptor so later fetches never change a queued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub id: JobId,
    pub descriptor: AppDescriptor,
    pub target_filename: String,
    pub source_url: String,
}

/// `apk_path` as-is when it already carries a URL scheme, otherwise joined
/// onto `base_url`.
#[must_use]
pub fn source_url(apk_path: &str, base_url: &str) -> String {
    if has_url_scheme(apk_path) {
        apk_path.to_string()
    } else {
        format!("{base_url}{apk_path}")
    }
}

fn has_url_scheme(value: &str) -> bool {
    let Some((scheme, _)) = value.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download from {url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download from {url} stopped without a result")]
    Aborted { url: String },
}

impl DownloadError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why a job ended without reaching the installer.
#[derive(Debug, Error)]
pub enum QueueFailure {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("failed to rename {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal event for one job.
#[derive(Debug)]
pub struct JobCompleted {
    pub job_id: JobId,
    pub outcome: Result<PathBuf, DownloadError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Dispatched {
        job_id: JobId,
        package_id: String,
        source_url: String,
    },
    /// The artifact was handed to the installer.
    Installed {
        job_id: JobId,
        package_id: String,
        path: PathBuf,
    },
    Failed {
        job_id: JobId,
        package_id: String,
        reason: String,
    },
    Drained(DrainSummary),
}

/// Package ids per result, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub installed: Vec<String>,
    pub failed: Vec<String>,
}

impl DrainSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.installed.is_empty() && self.failed.is_empty()
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `job.source_url` and return where the artifact landed.
    async fn download(&self, job: &DownloadJob) -> Result<PathBuf, DownloadError>;
}

/// Streams artifacts into a directory without ever replacing an existing
/// file: a taken `name.apk` becomes `name-1.apk`, `name-2.apk`, and so on.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    dest_dir: PathBuf,
}

impl HttpDownloader {
    #[must_use]
    pub fn new(client: reqwest::Client, dest_dir: PathBuf) -> Self {
        Self { client, dest_dir }
    }

    #[must_use]
    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, job: &DownloadJob) -> Result<PathBuf, DownloadError> {
        use futures_util::StreamExt;

        let url = &job.source_url;
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| DownloadError::Request {
                    url: url.clone(),
                    source,
                })?;

        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.clone(),
                status: response.status(),
            });
        }

        tokio::fs::create_dir_all(&self.dest_dir)
            .await
            .map_err(|error| {
                DownloadError::io("failed to create download directory", &self.dest_dir, error)
            })?;

        let (dest, mut file) = create_unclaimed(&self.dest_dir, &job.target_filename).await?;
        debug!("Downloading {url} to {}", dest.display());

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    remove_artifact(&dest).await;
                    return Err(DownloadError::Request {
                        url: url.clone(),
                        source,
                    });
                }
            };
            if let Err(error) = file.write_all(&chunk).await {
                remove_artifact(&dest).await;
                return Err(DownloadError::io("failed to write", &dest, error));
            }
            written += chunk.len() as u64;
        }

        if let Err(error) = file.flush().await {
            remove_artifact(&dest).await;
            return Err(DownloadError::io("failed to flush", &dest, error));
        }

        info!("Downloaded {written} bytes to {}", dest.display());
        Ok(dest)
    }
}

async fn create_unclaimed(
    dir: &Path,
    file_name: &str,
) -> Result<(PathBuf, tokio::fs::File), DownloadError> {
    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (file_name, None),
    };

    for attempt in 0u32.. {
        let candidate = match (attempt, extension) {
            (0, _) => file_name.to_string(),
            (n, Some(extension)) => format!("{stem}-{n}.{extension}"),
            (n, None) => format!("{stem}-{n}"),
        };
        let path = dir.join(candidate);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(DownloadError::io("failed to create", &path, error)),
        }
    }

    Err(DownloadError::io(
        "no free file name for",
        &dir.join(file_name),
        std::io::Error::from(std::io::ErrorKind::AlreadyExists),
    ))
}

async fn remove_artifact(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        debug!("Could not remove {}: {error}", path.display());
    }
}

struct InFlight {
    job: DownloadJob,
    task: JoinHandle<()>,
}

/// Explicitly owned download queue: create it, enqueue, [`drain`], then
/// drop or [`dispose`] it.
///
/// [`drain`]: DownloadQueue::drain
/// [`dispose`]: DownloadQueue::dispose
pub struct DownloadQueue {
    downloader: Arc<dyn Downloader>,
    installer: Arc<dyn Installer>,
    base_url: String,
    pending: VecDeque<DownloadJob>,
    in_flight: Option<InFlight>,
    next_id: JobId,
    completions_tx: mpsc::UnboundedSender<JobCompleted>,
    completions_rx: mpsc::UnboundedReceiver<JobCompleted>,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
    installs: Vec<JoinHandle<()>>,
    summary: DrainSummary,
}

impl DownloadQueue {
    #[must_use]
    pub fn new(
        downloader: Arc<dyn Downloader>,
        installer: Arc<dyn Installer>,
        base_url: impl Into<String>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            downloader,
            installer,
            base_url: base_url.into(),
            pending: VecDeque::new(),
            in_flight: None,
            next_id: 1,
            completions_tx,
            completions_rx,
            events: None,
            installs: Vec::new(),
            summary: DrainSummary::default(),
        }
    }

    /// Publish [`QueueEvent`]s on `events` as jobs move through the queue.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<QueueEvent>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    #[must_use]
    pub fn in_flight_job(&self) -> Option<&DownloadJob> {
        self.in_flight.as_ref().map(|in_flight| &in_flight.job)
    }

    /// Queue a copy of `descriptor`. Nothing starts until [`start_next`].
    ///
    /// [`start_next`]: DownloadQueue::start_next
    pub fn enqueue(&mut self, descriptor: &AppDescriptor) -> JobId {
        let id = self.next_id;
        self.next_id += 1;

        let target_filename = if descriptor.resolved_download_name.is_empty() {
            resolve_download_name(descriptor)
        } else {
            descriptor.resolved_download_name.clone()
        };

        let job = DownloadJob {
            id,
            descriptor: descriptor.clone(),
            target_filename,
            source_url: source_url(&descriptor.apk_path, &self.base_url),
        };
        debug!(
            "Queued job {id}: {} {} as {}",
            job.descriptor.package_id, job.descriptor.highest_server_version, job.target_filename
        );
        self.pending.push_back(job);
        id
    }

    /// Dispatch the next pending job. Does nothing while a job is in flight
    /// or when nothing is pending.
    pub fn start_next(&mut self) -> Option<JobId> {
        if self.in_flight.is_some() {
            return None;
        }
        let job = self.pending.pop_front()?;

        info!(
            "Downloading {} from {}",
            job.descriptor.package_id, job.source_url
        );
        self.emit(QueueEvent::Dispatched {
            job_id: job.id,
            package_id: job.descriptor.package_id.clone(),
            source_url: job.source_url.clone(),
        });

        let downloader = Arc::clone(&self.downloader);
        let completions = self.completions_tx.clone();
        let task_job = job.clone();
        let task = tokio::spawn(async move {
            // A panic ends the job like any other failure.
            let outcome = std::panic::AssertUnwindSafe(downloader.download(&task_job))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(DownloadError::Aborted {
                        url: task_job.source_url.clone(),
                    })
                });
            let _ = completions.send(JobCompleted {
                job_id: task_job.id,
                outcome,
            });
        });

        let id = job.id;
        self.in_flight = Some(InFlight { job, task });
        Some(id)
    }

    /// Handle the terminal event of the in-flight job and dispatch the next
    /// one. Events for any other job id are ignored.
    pub async fn on_job_terminal(&mut self, completed: JobCompleted) -> Option<JobId> {
        if self
            .in_flight
            .as_ref()
            .is_none_or(|in_flight| in_flight.job.id != completed.job_id)
        {
            debug!("Ignoring completion for job {}", completed.job_id);
            return None;
        }
        let InFlight { job, .. } = self.in_flight.take()?;
        let package_id = job.descriptor.package_id.clone();

        let finished = match completed.outcome {
            Ok(path) => finalize_artifact(&job, path).await,
            Err(error) => Err(QueueFailure::Download(error)),
        };

        match finished {
            Ok(path) => {
                let installer = Arc::clone(&self.installer);
                let install_path = path.clone();
                let install_package = package_id.clone();
                self.installs.push(tokio::spawn(async move {
                    if let Err(error) = installer
                        .install_artifact(&install_path, &install_package)
                        .await
                    {
                        warn!("Install request for {install_package} failed: {error}");
                    }
                    remove_artifact(&install_path).await;
                }));
                self.summary.installed.push(package_id.clone());
                self.emit(QueueEvent::Installed {
                    job_id: job.id,
                    package_id,
                    path,
                });
            }
            Err(failure) => {
                warn!("Download job {} for {package_id} failed: {failure}", job.id);
                self.summary.failed.push(package_id.clone());
                self.emit(QueueEvent::Failed {
                    job_id: job.id,
                    package_id,
                    reason: failure.to_string(),
                });
            }
        }

        self.start_next()
    }

    /// Run every queued job to completion, one at a time.
    pub async fn drain(&mut self) -> DrainSummary {
        self.start_next();
        while self.in_flight.is_some() {
            let Some(completed) = self.completions_rx.recv().await else {
                break;
            };
            self.on_job_terminal(completed).await;
        }
        self.finish_installs().await;

        let summary = std::mem::take(&mut self.summary);
        if !summary.is_empty() {
            info!(
                "Download queue drained: {} installed, {} failed",
                summary.installed.len(),
                summary.failed.len()
            );
        }
        self.emit(QueueEvent::Drained(summary.clone()));
        summary
    }

    /// Wait for every install request handed out so far. Install results
    /// are not observed, but the requests must not die with the process.
    /// Each artifact is deleted once its request is done.
    pub async fn finish_installs(&mut self) {
        for install in std::mem::take(&mut self.installs) {
            if let Err(error) = install.await {
                warn!("Install task did not finish: {error}");
            }
        }
    }

    /// Drop every job that has not started yet.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Abort the in-flight job and drop everything pending.
    pub fn dispose(mut self) {
        self.clear();
        if let Some(in_flight) = self.in_flight.take() {
            debug!("Aborting in-flight job {}", in_flight.job.id);
            in_flight.task.abort();
        }
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Manager builds must end up under their original file name before they
/// reach the installer.
async fn finalize_artifact(job: &DownloadJob, path: PathBuf) -> Result<PathBuf, QueueFailure> {
    if job.descriptor.package_id != packages::MANAGER {
        return Ok(path);
    }

    let target = path.with_file_name(&job.target_filename);
    if target == path {
        return Ok(path);
    }

    tokio::fs::rename(&path, &target)
        .await
        .map_err(|source| QueueFailure::Rename {
            from: path.clone(),
            to: target.clone(),
            source,
        })?;
    debug!("Renamed {} to {}", path.display(), target.display());
    Ok(target)
}
