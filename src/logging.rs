use std::sync::Once;

use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

static LOGGING_INIT: Once = Once::new();

/// Initialize logging.  Output only happens if the environment variable
/// `RUST_LOG` is set to a non-empty value, and it always goes to stderr because
/// stdout carries protocol messages.
///
/// Safe to call more than once; tests call it freely.
pub fn init_logging() {
    LOGGING_INIT.call_once(|| {
        // Our wrapper scripts frequently set RUST_LOG unconditionally but
        // potentially with an empty value, and we don't want that to be
        // interpreted as a desire to enable logging.
        let rustlog = match std::env::var("RUST_LOG") {
            Ok(rustlog) if !rustlog.is_empty() => rustlog,
            _ => return,
        };
        let env_filter = match EnvFilter::try_new(&rustlog) {
            Ok(filter) => filter,
            Err(err) => {
                eprintln!("ignoring bad RUST_LOG {:?}: {}", rustlog, err);
                return;
            }
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .compact()
            // The log usually ends up in a file next to the UI's own logs,
            // so ANSI isn't helpful.
            .with_ansi(false)
            .without_time()
            .with_filter(env_filter)
            .boxed();

        // Another subscriber may already be installed by an embedding
        // application; that one wins.
        let _ = Registry::default().with(layer).try_init();
    });
}
