pub mod hal;
pub mod loom;

/// Installs a global subscriber forwarding spans to Tracy.
#[cfg(feature = "trace")]
pub fn setup_tracing() {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        log::warn!("failed to set tracing subscriber: {err}");
    }
}
