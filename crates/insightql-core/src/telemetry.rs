use tracing_subscriber::EnvFilter;

/// Installs the JSON `tracing` subscriber used by embedding processes.
///
/// Honors `RUST_LOG` and always enables `insightql=info`. Returns an error if
/// the directive does not parse; a subscriber that is already installed is
/// left in place.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("insightql=info".parse()?);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
    Ok(())
}
