//! Tick and wall-clock sources for chunk timestamps.
//!
//! Ticks are monotonic nanoseconds; `TICKS_PER_SECOND` is fixed at 1e9 so a
//! reader can convert without consulting the platform. Wall time is captured
//! once per chunk for correlation, never on the per-event path.

/// Tick rate recorded in every chunk header.
pub const TICKS_PER_SECOND: u64 = 1_000_000_000;

/// Current monotonic tick value.
#[cfg(unix)]
pub fn ticks_now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid timespec on the stack. CLOCK_MONOTONIC is
    // always available on unix and the call cannot fail with a valid pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
pub fn ticks_now() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Wall-clock nanoseconds since the unix epoch.
pub fn wall_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// OS thread id of the calling thread, used as the writer identity token.
/// Falls back to a process-local counter where `gettid` is unavailable.
#[cfg(target_os = "linux")]
pub fn current_thread_token() -> u64 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
    if tid == 0 { fallback_token() } else { tid }
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_token() -> u64 {
    fallback_token()
}

fn fallback_token() -> u64 {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: Cell<u64> = const { Cell::new(0) };
    }
    TOKEN.with(|cell| {
        let mut t = cell.get();
        if t == 0 {
            t = NEXT.fetch_add(1, Ordering::Relaxed);
            cell.set(t);
        }
        t
    })
}
