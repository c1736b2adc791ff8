//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM raise a shared stop flag that the backend event loop
//! polls once per iteration. The handler itself only touches a static
//! atomic (the only thing safe to do in signal context); a small watcher
//! thread forwards it to the caller's flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

static SIGNAL_SEEN: AtomicBool = AtomicBool::new(false);

/// Register handlers for SIGINT and SIGTERM that raise `stop`.
///
/// # Example
/// ```ignore
/// let stop = Arc::new(AtomicBool::new(false));
/// setup_signal_handlers(stop.clone());
///
/// while !stop.load(Ordering::Relaxed) {
///     // poll
/// }
/// ```
pub fn setup_signal_handlers(stop: Arc<AtomicBool>) {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
    }

    std::thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || loop {
            if SIGNAL_SEEN.load(Ordering::Relaxed) {
                eprintln!("received shutdown signal, stopping backend...");
                stop.store(true, Ordering::Relaxed);
                return;
            }
            if stop.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        })
        .expect("spawn signal watcher");
}

#[cfg(unix)]
extern "C" fn signal_handler(_: libc::c_int) {
    SIGNAL_SEEN.store(true, Ordering::Relaxed);
}
