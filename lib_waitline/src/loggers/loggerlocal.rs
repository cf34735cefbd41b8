use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Maps a textual level to a `log` filter. Unknown values fall back to `Info`.
pub fn level_from_str(log_level: &str) -> log::LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger: every record goes to stdout and to
/// `<log_dir>/<app_name>_<timestamp>.log`. Older `<app_name>_*.log` files in
/// `log_dir` are removed first so only the newest run is kept.
///
/// Returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<PathBuf, fern::InitError> {
    fs::create_dir_all(log_dir)?;
    cleanup_old_logs(log_dir, app_name)?;

    let log_file_name = format!(
        "{}_{}.log",
        app_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level_from_str(log_level))
        .chain(io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

/// Deletes every `<app_name>_*.log` in `log_dir` except the most recently
/// modified one.
pub(crate) fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> io::Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let path = e.path();
            path.extension().is_some_and(|ext| ext == "log")
                && e.file_name().to_string_lossy().starts_with(&prefix)
        })
        .collect();

    // Newest first; unreadable metadata sorts last and gets deleted.
    entries.sort_by_key(|e| {
        std::cmp::Reverse(e.metadata().and_then(|m| m.modified()).ok())
    });

    let mut removed = 0;
    for entry in entries.iter().skip(1) {
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn test_level_from_str() {
        assert_eq!(level_from_str("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(level_from_str("fatal"), log::LevelFilter::Error);
        assert_eq!(level_from_str("nonsense"), log::LevelFilter::Info);
    }

    #[test]
    fn test_cleanup_keeps_newest_log_of_the_app_only() {
        let dir = tempdir().expect("Failed to create temporary directory");
        let old = dir.path().join("waitline_old.log");
        let new = dir.path().join("waitline_new.log");
        let other = dir.path().join("other_app.log");
        for path in [&old, &new, &other] {
            fs::write(path, "x").unwrap();
        }
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), "waitline").unwrap(), 1);
        assert!(!old.exists());
        assert!(new.exists());
        assert!(other.exists());
    }
}
