use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Log output goes to stderr so that stdout stays clean for the tool's own
/// report (plan listing, progress lines). `RUST_LOG` overrides the default
/// level when set.
pub fn init(default_level: LevelFilter) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
