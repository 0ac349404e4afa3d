use std::io::Write;

use chrono::Utc;
use log::info;

/// Initialize `env_logger`. `RUST_LOG` wins when set; otherwise `log_level`
/// (usually `LOG_LEVEL` from the environment) is the filter.
pub fn init_logging(log_level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_string());
    let result = env_logger::Builder::new()
        .parse_filters(&filter)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
    if result.is_ok() {
        info!("Logger initialized with filter '{}'", filter);
    }
}
