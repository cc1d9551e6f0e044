use tracing_subscriber::EnvFilter;

/// Map a `LOG_LEVEL` value to a filter directive. Accepts tracing names as
/// well as the `WARNING`/`CRITICAL` spellings used by most hosting defaults.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" | "FATAL" => "error",
        _ => "info",
    }
}

/// Install the global subscriber. JSON lines on Cloud Run (`K_SERVICE` set),
/// human-readable output elsewhere. Call once, before anything logs.
pub fn init(level: Option<&str>, json: bool) {
    let filter = EnvFilter::new(level_directive(level.unwrap_or("INFO")));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    }
}
