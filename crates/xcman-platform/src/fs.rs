use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Write `data` to `path` through a sibling temp file and a rename, so
/// readers see either the old content or the new, never a partial file.
/// Missing parent directories are created.
///
/// # Errors
/// Returns an error if the temp file cannot be written or the rename fails.
/// The temp file is removed when the rename fails.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = create_sibling_temp(parent, path)?;
    let written = file.write_all(data).and_then(|()| file.sync_all());
    drop(file);

    if let Err(error) = written.and_then(|()| std::fs::rename(&tmp_path, path)) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}

/// Exclusively create `.<name>.<pid>.<n>.tmp` next to `path`.
fn create_sibling_temp(dir: &Path, path: &Path) -> std::io::Result<(PathBuf, File)> {
    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("data");
    let pid = std::process::id();

    for attempt in 0..32_u8 {
        let candidate = dir.join(format!(".{file_name}.{pid}.{attempt}.tmp"));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        "no free temp file name",
    ))
}

#[cfg(test)]
mod tests {
    use super::write_atomic;

    #[test]
    fn write_atomic_replaces_existing_file_without_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("state.json");
        std::fs::write(&path, "old").expect("seed file should be written");

        write_atomic(&path, b"new").expect("atomic write should succeed");

        assert_eq!(
            std::fs::read_to_string(&path).expect("file should be readable"),
            "new"
        );
        let leftovers = std::fs::read_dir(temp.path())
            .expect("read temp dir entries")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn write_atomic_creates_missing_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("nested/dir/manifest.json");

        write_atomic(&path, b"[]").expect("atomic write should create parents");

        assert!(path.is_file());
    }
}
