//! Process-wide crash logging
//!
//! Installs a panic hook that records the panic message, the thread it
//! happened on and a captured backtrace through `tracing` before handing
//! over to the previously installed hook. No recovery is attempted.

use std::backtrace::Backtrace;
use std::sync::Once;

static INSTALL: Once = Once::new();

/// Install the crash hook. Calling this more than once is a no-op.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let thread = std::thread::current();
            let backtrace = Backtrace::force_capture();
            tracing::error!(
                thread = thread.name().unwrap_or("<unnamed>"),
                "Fatal panic: {}\n{}",
                info,
                backtrace
            );
            previous(info);
        }));
        tracing::debug!("Crash hook installed");
    });
}

/// Whether [`install`] has already run in this process
pub fn is_installed() -> bool {
    INSTALL.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install();
        install();
        assert!(is_installed());
    }
}
