//! Tick accounting and sleep wakeups.
//!
//! The hardware timer fires at the PIT's default divisor (~18.2 Hz on
//! x86_64; the riscv64 SBI timer is programmed to the same period). Each
//! tick bumps the global counter and scans for sleepers whose deadline
//! has passed.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::process::{table, PendingOp, ProcState};

/// Nominal tick rate.
pub const TICK_HZ: u64 = 18;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Milliseconds since boot, at tick granularity.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TICK_HZ
}

/// Absolute wake tick for a sleep of `ms` milliseconds. `sleep(0)` wakes
/// at the next tick.
pub fn wake_tick_after_ms(ms: u64) -> u64 {
    ticks() + (ms * TICK_HZ / 1000).max(1)
}

/// Called from the timer interrupt. Advances the counter and wakes any
/// sleeper whose deadline has arrived.
pub fn on_tick() {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    for slot in 0..table::MAX_PROCESSES {
        if table::slot_state(slot) != ProcState::Blocked {
            continue;
        }
        // SAFETY: peeking at pending/sleep_until of a blocked slot; the
        // wake itself re-validates through `wake_slot`.
        let (pending, until) = {
            let proc = unsafe { table::slot_mut(slot) };
            (proc.pending, proc.sleep_until)
        };
        if pending == PendingOp::Sleep && now >= until {
            crate::sched::wake_slot(slot);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn sleep_zero_wakes_next_tick() {
        let now = ticks();
        assert_eq!(wake_tick_after_ms(0), now + 1);
    }

    #[test]
    fn wake_tick_scales_with_rate() {
        let now = ticks();
        assert_eq!(wake_tick_after_ms(1000), now + TICK_HZ);
        assert!(wake_tick_after_ms(50) >= now + 1);
    }
}
