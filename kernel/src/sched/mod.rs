//! Multi-core scheduling.

pub mod percpu;
pub mod queue;
pub mod scheduler;

pub use percpu::{bring_online, cpu, online_count, this_cpu, MAX_CORES};
pub use scheduler::{
    attempt_console_read, attempt_pipe_read, attempt_pipe_write, block_current, current_slot,
    enqueue, least_loaded_core, retire_and_wake, schedule_next, service_tlb_flush, start,
    tlb_shootdown, wake_pid, wake_slot,
};
