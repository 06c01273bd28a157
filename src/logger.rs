use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_PATH: &str = "agent-relay.log";

/// Rotate once the active file holds this many lines
const MAX_ENTRIES: usize = 5_000;

/// Install the file-backed logger as the `log` crate backend.
///
/// Writes are append-only. When the active file reaches its line cap it is
/// rotated to `<path>.old` (replacing any previous generation) and a fresh
/// file is started; the same rotation runs at startup so each run begins
/// with an empty active log. Safe to call once; later calls are ignored.
pub fn init(level: LevelFilter) {
    let logger = FileLogger::open(PathBuf::from(LOG_PATH), MAX_ENTRIES, level);
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level);
    }
}

struct FileLogger {
    path: PathBuf,
    max_entries: usize,
    level: LevelFilter,
    sink: Mutex<Sink>,
}

struct Sink {
    file: Option<File>,
    entries: usize,
}

impl FileLogger {
    fn open(path: PathBuf, max_entries: usize, level: LevelFilter) -> Self {
        rotate(&path);
        let file = open_active(&path);
        Self {
            path,
            max_entries,
            level,
            sink: Mutex::new(Sink { file, entries: 0 }),
        }
    }

    fn write_entry(&self, line: &str) {
        let mut sink = self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if sink.entries >= self.max_entries {
            sink.file = None;
            rotate(&self.path);
            sink.file = open_active(&self.path);
            sink.entries = 0;
        }

        // A failed open is retried on the next entry rather than cached
        if sink.file.is_none() {
            sink.file = open_active(&self.path);
        }

        if let Some(file) = sink.file.as_mut() {
            match writeln!(file, "{}", line) {
                Ok(()) => sink.entries += 1,
                Err(err) => {
                    eprintln!("Logger: write to {} failed: {}", self.path.display(), err);
                    sink.file = None;
                }
            }
        }
    }
}

/// Move the active log aside as the single `.old` generation
fn rotate(path: &Path) {
    if !path.exists() {
        return;
    }
    let mut old = path.as_os_str().to_owned();
    old.push(".old");
    if let Err(err) = fs::rename(path, PathBuf::from(old)) {
        eprintln!("Logger: rotation of {} failed: {}", path.display(), err);
    }
}

fn open_active(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = fs::create_dir_all(parent) {
                eprintln!("Logger: failed to create {}: {}", parent.display(), err);
                return None;
            }
        }
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("Logger: failed to open {}: {}", path.display(), err);
            None
        }
    }
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {:5} [{}] {}",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        self.write_entry(&line);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_lines(path: &Path) -> Vec<String> {
        let mut raw = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut raw)
            .unwrap();
        raw.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn entries_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let logger = FileLogger::open(path.clone(), 100, LevelFilter::Info);

        logger.write_entry("first");
        logger.write_entry("second");

        assert_eq!(read_lines(&path), ["first", "second"]);
    }

    #[test]
    fn cap_rotates_to_old_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let logger = FileLogger::open(path.clone(), 3, LevelFilter::Info);

        for i in 0..5 {
            logger.write_entry(&format!("entry {}", i));
        }

        // Entries 0-2 rotated out; 3-4 in the active file
        assert_eq!(read_lines(&path), ["entry 3", "entry 4"]);
        let old = dir.path().join("run.log.old");
        assert_eq!(read_lines(&old), ["entry 0", "entry 1", "entry 2"]);
    }

    #[test]
    fn startup_rotates_the_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");

        let first = FileLogger::open(path.clone(), 100, LevelFilter::Info);
        first.write_entry("from the first run");
        drop(first);

        let second = FileLogger::open(path.clone(), 100, LevelFilter::Info);
        second.write_entry("from the second run");

        assert_eq!(read_lines(&path), ["from the second run"]);
        assert_eq!(
            read_lines(&dir.path().join("run.log.old")),
            ["from the first run"]
        );
    }
}
