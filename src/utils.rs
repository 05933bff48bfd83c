// Utility helpers for the Infinichat binary

use anyhow::Result;
use log::LevelFilter;

/// Initializes env_logger. `RUST_LOG` wins when set; otherwise the -v count
/// picks the level.
pub fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()))
        .format_timestamp_secs()
        .init();

    log::info!("logging initialized at level {}", level);
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
