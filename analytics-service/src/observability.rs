use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` directives take precedence
/// over the crate default of `info`.
pub fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(
        "analytics_service=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
