use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("another xcman process is already managing updates")]
    AlreadyRunning,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive advisory lock on the instance lock file, held for the life of
/// the value. Only the holder may touch schedule state or the queue.
#[derive(Debug)]
pub struct SingleInstance {
    _file: File,
}

impl SingleInstance {
    pub fn acquire(lock_path: &Path) -> Result<Self, AcquireError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| AcquireError::io("failed to create lock directory", error))?;
        }

        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|error| AcquireError::io("failed to open instance lock file", error))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(AcquireError::AlreadyRunning);
            }
            Err(error) => {
                return Err(AcquireError::io("failed to acquire instance lock", error));
            }
        }

        lock_file
            .set_len(0)
            .and_then(|()| lock_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(|error| AcquireError::io("failed to record lock owner", error))?;

        Ok(Self { _file: lock_file })
    }
}

#[cfg(test)]
mod tests {
    use super::{AcquireError, SingleInstance};

    #[test]
    fn second_acquire_reports_already_running() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let lock_path = temp_dir.path().join("data").join("instance.lock");

        let first = SingleInstance::acquire(&lock_path).expect("first acquire should succeed");
        let second = SingleInstance::acquire(&lock_path);
        assert!(matches!(second, Err(AcquireError::AlreadyRunning)));

        drop(first);
        SingleInstance::acquire(&lock_path).expect("lock should be free after release");
    }

    #[test]
    fn lock_file_records_owner_pid() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let lock_path = temp_dir.path().join("instance.lock");

        let _guard = SingleInstance::acquire(&lock_path).expect("acquire should succeed");

        let contents = std::fs::read_to_string(&lock_path).expect("lock file should be readable");
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
