//! CPU-time accounting for the engine thread.
//!
//! Each isolate runs alone on a dedicated thread, so the thread's CPU clock
//! is the isolate's CPU time. On Linux the clock can be read live from any
//! thread; elsewhere the engine thread publishes a sample after every command.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative CPU time as a (seconds, nanoseconds) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuTime {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl CpuTime {
    pub fn from_nanos(nanos: u64) -> Self {
        Self {
            seconds: nanos / 1_000_000_000,
            nanoseconds: (nanos % 1_000_000_000) as u32,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.seconds * 1_000_000_000 + self.nanoseconds as u64
    }

    /// Seconds and nanoseconds combined into milliseconds.
    pub fn as_millis_f64(&self) -> f64 {
        (self.seconds as f64 + self.nanoseconds as f64 / 1e9) * 1000.0
    }
}

#[derive(Debug)]
pub(crate) struct CpuClock {
    #[cfg(target_os = "linux")]
    clock: Option<libc::clockid_t>,
    published: AtomicU64,
}

impl CpuClock {
    /// Bind to the calling thread. Must run on the engine thread.
    pub(crate) fn for_current_thread() -> Self {
        let clock = Self {
            #[cfg(target_os = "linux")]
            clock: current_thread_clock(),
            published: AtomicU64::new(0),
        };
        clock.publish();
        clock
    }

    /// Record the calling thread's CPU time. Must run on the engine thread.
    pub(crate) fn publish(&self) {
        if let Some(sample) = thread_cpu_time() {
            self.published.store(sample.as_nanos(), Ordering::SeqCst);
        }
    }

    /// Current CPU time of the engine thread.
    pub(crate) fn read(&self) -> CpuTime {
        let published = CpuTime::from_nanos(self.published.load(Ordering::SeqCst));
        #[cfg(target_os = "linux")]
        if let Some(live) = self.clock.and_then(read_clock) {
            return live.max(published);
        }
        published
    }
}

#[cfg(target_os = "linux")]
fn current_thread_clock() -> Option<libc::clockid_t> {
    let mut clock: libc::clockid_t = 0;
    // SAFETY: pthread_self() is always a valid handle for the calling thread
    // and `clock` is a valid out-pointer.
    let rc = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock) };
    (rc == 0).then_some(clock)
}

#[cfg(unix)]
fn read_clock(clock: libc::clockid_t) -> Option<CpuTime> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer; an invalid clock id only yields EINVAL.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    (rc == 0).then(|| CpuTime {
        seconds: ts.tv_sec as u64,
        nanoseconds: ts.tv_nsec as u32,
    })
}

#[cfg(unix)]
fn thread_cpu_time() -> Option<CpuTime> {
    read_clock(libc::CLOCK_THREAD_CPUTIME_ID)
}

#[cfg(not(unix))]
fn thread_cpu_time() -> Option<CpuTime> {
    None
}
