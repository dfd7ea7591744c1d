use tracing_subscriber::EnvFilter;

use crate::gateway::in_container;

/// Structured logging via tracing with an env-filter override
/// (`RUST_LOG=info,mcp_gateway=debug`). Logs go to stderr so the stdio
/// transport keeps stdout for the protocol. Inside a container the default
/// is quieter; `--verbose` turns on debug for the crate.
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "info,mcp_gateway=debug"
    } else if in_container() {
        "warn,mcp_gateway=info"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
