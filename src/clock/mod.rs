//! OS clock and thread-identity collaborators.
//!
//! GPU timestamps are correlated against `CLOCK_MONOTONIC`, the same clock
//! domain the perf subsystem stamps its ring-buffer records with.

/// Read `CLOCK_MONOTONIC` in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid timespec on the stack and CLOCK_MONOTONIC is
    // always available on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// OS thread id of the calling thread via `gettid()`.
pub fn current_thread_id() -> u32 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_ns_is_nondecreasing() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a, "clock went backwards: {a} -> {b}");
        assert!(a > 0);
    }

    #[test]
    fn test_current_thread_id_stable_within_thread() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn test_current_thread_id_differs_across_threads() {
        let main_tid = current_thread_id();
        let other_tid = std::thread::spawn(current_thread_id)
            .join()
            .expect("spawned thread");
        assert_ne!(main_tid, other_tid);
    }
}
