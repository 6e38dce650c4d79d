//! log4rs setup for the CLI and for worker processes.

use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Timestamped log file inside `log_dir`, one per run.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    log_dir.join(format!("{timestamp}.log"))
}

/// Logs to stderr and, when `log_dir` is given, to a file in it.
pub fn build_config(
    log_dir: Option<&Path>,
    level: LevelFilter,
) -> Result<Config, Box<dyn std::error::Error>> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut config = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(log_dir) = log_dir {
        std::fs::create_dir_all(log_dir)?;
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(log_file_path(log_dir))?;
        config = config.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    Ok(config.build(root.build(level))?)
}

pub fn setup_logging(
    log_dir: Option<&Path>,
    level: LevelFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    log4rs::init_config(build_config(log_dir, level)?)?;
    Ok(())
}

/// Worker processes own stdout for the protocol, so they only log to stderr.
pub fn setup_worker_logging(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    setup_logging(None, level)
}
