//! Tracing bootstrap

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_DIRECTIVES: &str = "storage=info,checkpoint=info,runtime_core=info";

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG` and falls back to `default_directives`. Returns `false`
/// when a subscriber was already installed, so repeated calls (tests, embedding
/// applications that configure logging themselves) are harmless.
pub fn init_tracing(default_directives: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(DEFAULT_DIRECTIVES);
        assert!(!init_tracing(DEFAULT_DIRECTIVES));
    }
}
