pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds the default terminal logger used by binaries and examples. Library
/// components never call this themselves; they receive a `Logger` (or `None`
/// for a discard root) from their owner.
pub fn terminal() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Malformed logger configuration");

    config.build_logger().expect("Logger construction failed")
}

/// A root logger that swallows everything. Used when a component is handed
/// `None` for its parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
