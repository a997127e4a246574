//! Tracy profiler integration
//!
//! Build with: cargo build --release --features tracy
//! Without the feature every function here is a no-op.

/// Open a profiling span for the rest of the enclosing scope
#[macro_export]
macro_rules! profile_scope {
    ($name:expr) => {
        #[cfg(feature = "tracy")]
        let _span = tracing::info_span!($name).entered();
        #[cfg(not(feature = "tracy"))]
        let _ = $name; // Suppress unused warning
    };
}

/// Install the Tracy subscriber.
/// Returns true if it initialized logging (the caller should skip env_logger).
#[cfg(feature = "tracy")]
pub fn init() -> bool {
    use tracing_subscriber::layer::SubscriberExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_tracy::TracyLayer::default());

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install Tracy subscriber: {e}");
        return false;
    }

    // Route log:: records into tracing so Tracy sees them too
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records into tracing: {e}");
        return false;
    }

    log::info!("Tracy profiler connected");
    true
}

#[cfg(not(feature = "tracy"))]
pub fn init() -> bool {
    false
}

/// Mark the end of a presented frame
#[cfg(feature = "tracy")]
pub fn frame_mark() {
    tracing::info!(target: "tracy", "frame");
}

#[cfg(not(feature = "tracy"))]
pub fn frame_mark() {}
