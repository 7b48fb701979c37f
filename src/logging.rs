// Tracing setup
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Install the global subscriber. With `log_dir`, events are mirrored to a
/// dated file in that directory.
pub fn init(level: &str, log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let Some(dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(level).init();
        return Ok(None);
    };
    std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
    let path = dir.join(log_file_name(chrono::Local::now().date_naive()));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_ansi(false)
        .with_writer(std::io::stdout.and(Mutex::new(file)))
        .init();
    Ok(Some(path))
}

fn log_file_name(date: chrono::NaiveDate) -> String {
    format!("store_load_{}.log", date.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_file_per_day() {
        let d = chrono::NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        assert_eq!(log_file_name(d), "store_load_20250701.log");
    }
}
