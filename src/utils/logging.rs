/// Initialize tracing/logging for the broker.
///
/// Maps `default_level` onto a `tracing::Level`; unknown strings fall back to
/// `info`. Uses `try_init` so tests and embedders can call it repeatedly.
pub fn init(default_level: &str) {
    let lvl = parse_level(default_level);

    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}

pub(crate) fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
