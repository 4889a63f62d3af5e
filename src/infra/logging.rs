//! Tracing subscriber setup shared by the binaries
//!
//! Level comes from `RUST_LOG`, falling back to the binary's default.
//! Timestamps are RFC 3339 UTC. Logs go to stderr so stdout stays free
//! for command output.

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber; `json` switches to one JSON object per line
pub fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
