//! Process-wide logger bootstrap.

use std::sync::Once;

use flexi_logger::Logger;

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Initializes the process-wide logger from `RUST_LOG`, defaulting to the
/// `error` level when unset. Safe to call from multiple threads; only the
/// first call has an effect.
///
/// The library itself only emits through the [`log`] facade, so embedders
/// that install their own logger should simply not call this.
pub fn init() {
    INIT_LOG.call_once(|| {
        Logger::try_with_env_or_str("error")
            .expect("invalid logger specification in environment")
            .start()
            .expect("failed to start logger");
    });
}
