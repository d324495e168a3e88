use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Output goes to stderr: stdout may be the tunnel channel itself.
/// `RUST_LOG` overrides the default level.
pub fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,text_tunnel=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
