#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use xcman_platform::AppPaths;

/// Append-only log sink that reopens its file if something deletes it
/// while a long-running `watch` is still writing.
struct ReopeningLogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReopeningLogFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = Self::append_to(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn append_to(path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    }
}

impl Write for ReopeningLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !self.path.exists() {
            *file = Self::append_to(&self.path)?;
        }
        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// Drop the older half of `log_path` once it grows past `max_bytes`,
/// cutting at a line boundary.
fn trim_oversized_log(log_path: &Path, max_bytes: u64) {
    let Ok(metadata) = std::fs::metadata(log_path) else {
        return;
    };
    if metadata.len() <= max_bytes {
        return;
    }
    let Ok(contents) = std::fs::read(log_path) else {
        return;
    };

    let half = contents.len() / 2;
    let keep_from = contents[half..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(half, |pos| half + pos + 1);
    let _ = xcman_platform::write_atomic(log_path, &contents[keep_from..]);
}

/// Route `log` output for every `xcman*` target into `debug.log` (and the
/// terminal in debug builds). Logging is best effort: any setup failure
/// leaves the process running without a file sink.
pub fn init_logging(paths: &AppPaths, verbose: bool, max_log_size: u64) {
    let log_path = paths.log_file();
    trim_oversized_log(&log_path, max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("xcman")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        LevelFilter::Debug,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));

    match ReopeningLogFile::open(log_path.clone()) {
        Ok(sink) => loggers.push(WriteLogger::new(LevelFilter::Debug, config, sink)),
        Err(error) => eprintln!(
            "xcman: cannot open log file {}: {error}",
            log_path.display()
        ),
    }

    if loggers.is_empty() || CombinedLogger::init(loggers).is_err() {
        return;
    }

    set_verbose(verbose);
    log::debug!("Logging to {}", log_path.display());
}

pub fn set_verbose(verbose: bool) {
    log::set_max_level(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::{ReopeningLogFile, set_verbose, trim_oversized_log};

    #[test]
    fn log_file_is_recreated_after_deletion() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("logs").join("debug.log");
        let mut sink = ReopeningLogFile::open(log_path.clone()).expect("log file should open");

        sink.write_all(b"check started\n")
            .expect("initial write should succeed");
        std::fs::remove_dir_all(temp_dir.path().join("logs"))
            .expect("log directory should be removable");
        sink.write_all(b"check finished\n")
            .expect("sink should recreate the file");

        let contents = std::fs::read_to_string(&log_path).expect("log should be readable");
        assert_eq!(contents, "check finished\n");
    }

    #[test]
    fn oversized_log_keeps_newest_lines() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("debug.log");
        std::fs::write(&log_path, "old-1\nold-2\nold-3\nnew-1\nnew-2\n")
            .expect("log should be written");

        trim_oversized_log(&log_path, 10);

        let trimmed = std::fs::read_to_string(&log_path).expect("log should be readable");
        assert!(trimmed.ends_with("new-2\n"));
        assert!(!trimmed.contains("old-1"));
        assert!(trimmed.starts_with("new-1\n") || trimmed.starts_with("old-3\n"));
    }

    #[test]
    fn small_log_is_left_alone() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("debug.log");
        std::fs::write(&log_path, "a\nb\n").expect("log should be written");

        trim_oversized_log(&log_path, 1024);

        assert_eq!(
            std::fs::read_to_string(&log_path).expect("log should be readable"),
            "a\nb\n"
        );
    }

    #[test]
    fn verbose_switch_moves_between_info_and_debug() {
        set_verbose(true);
        assert_eq!(log::max_level(), log::LevelFilter::Debug);

        set_verbose(false);
        assert_eq!(log::max_level(), log::LevelFilter::Info);
    }
}
