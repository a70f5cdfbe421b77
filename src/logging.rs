use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Installs the global fmt subscriber. Later calls are ignored.
pub fn init(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
