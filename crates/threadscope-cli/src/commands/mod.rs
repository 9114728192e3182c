pub mod serve;
pub mod snapshot;
pub mod watch;

use tokio_util::sync::CancellationToken;

/// Multi-threaded runtime for a command; exits the process if it cannot start.
pub fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting async runtime: {e}");
            std::process::exit(1);
        }
    }
}

/// Token cancelled by the first Ctrl+C or SIGTERM.
pub fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("termination signal received, shutting down");
        t.cancel();
    }) {
        log::warn!("could not install signal handler: {e}");
    }
    token
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn sigterm_cancels_the_shutdown_token() {
        let token = shutdown_on_signal();
        // SAFETY: raise() only delivers a signal to this process; the handler
        // installed above catches it.
        let rc = unsafe { libc::raise(libc::SIGTERM) };
        assert_eq!(rc, 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !token.is_cancelled() {
            assert!(Instant::now() < deadline, "SIGTERM did not cancel the token");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
