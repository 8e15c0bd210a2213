//! Cooperative backoff for the transport's spin-and-yield suspension points.

use std::time::Duration;

/// Yield with geometric backoff: busy for the first iterations, then
/// yielding the thread, then sleeping. `k` is the iteration count of the
/// enclosing retry loop.
pub fn yield_k(k: usize) {
    if k < 4 {
        // fall straight through to the next attempt
    } else if k < 16 {
        std::hint::spin_loop();
    } else if k < 64 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(k.min(4096) as u64));
    }
}
