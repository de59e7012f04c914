//! The scheduler: round-robin per core, work stealing across cores, and
//! the resume protocol.
//!
//! Kernel mode is preemption-free: a thread runs from kernel entry to the
//! next blocking point or syscall return. Suspension happens only through
//! [`block_current`] / [`schedule_next`], and every return to userspace
//! goes through [`switch_to`], whose post-switch hook finishes whatever
//! operation the thread was blocked on -- it is the single place where a
//! continuation is interpreted, and it runs with the target's address
//! space active so user pointers are meaningful again.

use core::sync::atomic::Ordering;

use super::percpu::{self, this_cpu, MAX_CORES};
use crate::{
    error::Errno,
    ipc::{message::UserMessage, pipe},
    mm::paging,
    process::{table, PendingOp, ProcState, WaitTarget},
};

/// What the post-switch hook decided.
enum Hook {
    /// First entry to userspace: restore the full initial frame.
    FirstRun,
    /// Resume the blocked syscall with this return value.
    Return(u64),
    /// The blocking condition still holds; pick someone else.
    Reblock,
}

/// Make a fully-built process runnable on its assigned core.
pub fn start(slot: usize) {
    // SAFETY: creation path owns the slot until this call publishes it.
    let proc = unsafe { table::slot_mut(slot) };
    proc.state = ProcState::Ready;
    let core = proc.assigned_core;
    enqueue(slot, core);
    if core != crate::arch::cpu_id() {
        crate::arch::send_schedule_ipi(core);
    }
}

/// Push a ready slot onto `core`'s queue, spilling to any other core with
/// room if it is full.
pub fn enqueue(slot: usize, core: usize) {
    if percpu::cpu(core).queue.lock().push(slot) {
        return;
    }
    for other in percpu::online_cores() {
        if other.id != core && other.queue.lock().push(slot) {
            // SAFETY: waker/creator owns the slot's scheduling fields.
            unsafe { table::slot_mut(slot).assigned_core = other.id };
            crate::arch::send_schedule_ipi(other.id);
            return;
        }
    }
    panic!("all run queues full");
}

/// Wake a blocked slot: mark ready, enqueue, kick its core.
pub fn wake_slot(slot: usize) {
    // SAFETY: wakers hold the resource lock naming this slot, which is
    // the mutation right for state transitions out of Blocked.
    let proc = unsafe { table::slot_mut(slot) };
    if proc.state != ProcState::Blocked {
        return;
    }
    proc.state = ProcState::Ready;
    let core = proc.assigned_core;
    enqueue(slot, core);
    if core != crate::arch::cpu_id() {
        crate::arch::send_schedule_ipi(core);
    }
}

/// Wake by pid, re-validating pid → slot (wait lists hold stale pids).
pub fn wake_pid(pid: u64) {
    if let Some(slot) = table::slot_of_pid(pid) {
        wake_slot(slot);
    }
}

/// Least-loaded online core (spawn placement).
pub fn least_loaded_core() -> usize {
    percpu::least_loaded_core()
}

/// Slot currently running on this core.
pub fn current_slot() -> Option<usize> {
    this_cpu().current_slot()
}

/// TLB shootdown: every core in `cores` except this one gets a flush flag
/// and an IPI; this core flushes directly.
pub fn tlb_shootdown(cores: u64) {
    let me = crate::arch::cpu_id();
    for core in 0..MAX_CORES {
        if cores & (1 << core) == 0 {
            continue;
        }
        if core == me {
            crate::arch::flush_tlb_local();
        } else {
            percpu::cpu(core)
                .tlb_flush_pending
                .store(true, Ordering::Release);
            crate::arch::send_tlb_ipi(core);
        }
    }
}

/// Called from IPI/interrupt context: service a pending TLB flush.
pub fn service_tlb_flush() {
    let cpu = this_cpu();
    if cpu.tlb_flush_pending.swap(false, Ordering::AcqRel) {
        crate::arch::flush_tlb_local();
    }
}

/// Mark the current thread blocked and schedule away. Noreturn: the
/// thread continues in the post-switch hook when its resource fires.
pub fn block_current() -> ! {
    retire_and_wake(None)
}

/// Block (or retire, if the current thread already left `Running`) and
/// wake `target` once this core is off the current thread's kernel
/// stack.
///
/// The deferral matters: waking a rendezvous peer can cause another core
/// to resume *this* thread's continuation, which reuses the kernel stack
/// we are still executing on. The wake is parked in the per-cpu slot and
/// performed by the scheduler loop after the stack pivot.
pub fn retire_and_wake(target: Option<usize>) -> ! {
    let cpu = this_cpu();
    if let Some(slot) = cpu.current_slot() {
        // SAFETY: we are the core running `slot`.
        let proc = unsafe { table::slot_mut(slot) };
        if proc.state == ProcState::Running {
            proc.state = ProcState::Blocked;
        }
    }
    if let Some(t) = target {
        cpu.deferred_wake.store(t + 1, Ordering::Release);
    }
    schedule_next()
}

/// Pick and run the next thread. Noreturn.
///
/// Pivots onto the per-core scheduler stack first: the previous thread's
/// kernel stack must not be touched once it is visible to wakers.
pub fn schedule_next() -> ! {
    let core = crate::arch::cpu_id();
    crate::arch::switch_stack_and_run(percpu::sched_stack_top(core), scheduler_loop)
}

/// The scheduler proper, running on the dedicated per-core stack.
extern "C" fn scheduler_loop() -> ! {
    let cpu = this_cpu();

    // Deliver a wake parked by `retire_and_wake`: we are now on the
    // scheduler stack, so the woken peer may freely resume the previous
    // thread on another core.
    match cpu.deferred_wake.swap(0, Ordering::AcqRel) {
        0 => {}
        n => wake_slot(n - 1),
    }

    // Step 1: re-enqueue the previous thread if it is still runnable.
    if let Some(prev) = cpu.current_slot() {
        cpu.set_current(None);
        // SAFETY: this core still owns `prev`'s scheduling fields; it has
        // not been published as Blocked/Ready elsewhere.
        let proc = unsafe { table::slot_mut(prev) };
        if proc.state == ProcState::Running {
            proc.state = ProcState::Ready;
            enqueue(prev, cpu.id);
        }
    }

    loop {
        service_tlb_flush();

        // Step 2: local pop, validating state (killed threads may still
        // sit in queues).
        let next = {
            let mut q = cpu.queue.lock();
            let mut picked = None;
            while let Some(slot) = q.pop() {
                if table::slot_state(slot) == ProcState::Ready {
                    picked = Some(slot);
                    break;
                }
            }
            picked
        };
        if let Some(slot) = next {
            switch_to(slot);
        }

        // Step 3: steal half of some victim's queue, round-robin.
        if steal_work(cpu.id) {
            continue;
        }

        // Step 4: if anything is blocked or zombie, halt until an
        // interrupt wakes us; otherwise the machine is done.
        if table::live_count() == 0 {
            if cpu.id == 0 {
                log::info!(target: "sched", "no runnable threads remain; halting");
                crate::println!("crux: all processes exited");
            }
            crate::arch::halt_forever();
        }
        cpu.idle_ticks.fetch_add(1, Ordering::Relaxed);
        cpu.ipi_schedule.store(false, Ordering::Release);
        crate::arch::wait_for_interrupt();
    }
}

/// Try to steal from another core, scanning victims round-robin from
/// our neighbor. Returns true if any entries moved into our queue.
fn steal_work(me: usize) -> bool {
    let victim = (1..MAX_CORES)
        .map(|d| percpu::cpu((me + d) % MAX_CORES))
        .find(|c| {
            c.id != me && c.online.load(Ordering::Acquire) && c.load() > 0
        });
    let Some(victim) = victim else { return false };
    // Steal into a scratch queue first so no two per-core queue locks are
    // ever held at once (two cores stealing from each other would
    // deadlock otherwise).
    let mut scratch = super::queue::RunQueue::new();
    {
        let mut vq = victim.queue.lock();
        vq.steal_half_into(&mut scratch);
    }
    let moved = scratch.len();
    if moved == 0 {
        return false;
    }
    {
        let mut mine = percpu::cpu(me).queue.lock();
        while let Some(slot) = scratch.pop() {
            // SAFETY: stolen ready threads now belong to this core.
            unsafe { table::slot_mut(slot).assigned_core = me };
            if !mine.push(slot) {
                drop(mine);
                enqueue(slot, me);
                mine = percpu::cpu(me).queue.lock();
            }
        }
    }
    log::trace!(target: "sched", "core {} stole {} threads", me, moved);
    true
}

/// Install `slot` as this core's current thread and return to userspace.
/// Noreturn unless the post-switch hook re-blocks, in which case the
/// scheduler loop continues via `schedule_next`.
fn switch_to(slot: usize) -> ! {
    let cpu = this_cpu();
    // SAFETY: we popped `slot` from our queue in Ready state; this core
    // now owns it.
    let proc = unsafe { table::slot_mut(slot) };
    proc.state = ProcState::Running;
    proc.assigned_core = cpu.id;
    proc.cores_ran_on |= 1 << cpu.id;
    if let Some(g) = proc.group {
        crate::process::thread::note_core(g, cpu.id);
    }
    cpu.set_current(Some(slot));

    // SAFETY: the asm slot block belongs to this core; written before the
    // first possible syscall from this thread.
    unsafe {
        let slots = &mut *cpu.asm.get();
        slots.kernel_stack_top = proc.kstack_top();
        slots.saved_kernel_sp = proc.regs.saved_kernel_sp;
    }
    crate::arch::prepare_kernel_entry(proc.kstack_top());
    paging::switch_address_space(proc.effective_root());
    crate::arch::set_fs_base(proc.fs_base);

    match post_switch(slot) {
        Hook::FirstRun => {
            // SAFETY: regs were initialized by the loader; the address
            // space is active and maps ip/sp.
            let (ip, sp, flags) = {
                // Re-borrow: post_switch may have rewritten regs.
                // SAFETY: as above, this core owns the slot.
                let p = unsafe { table::slot_mut(slot) };
                p.fresh = false;
                (p.regs.ip, p.regs.sp, p.regs.flags)
            };
            crate::arch::enter_user(ip, sp, flags)
        }
        Hook::Return(value) => {
            // SAFETY: as above.
            let ksp = unsafe { table::slot_mut(slot) }.regs.saved_kernel_sp;
            crate::arch::resume_from_kernel_frame(ksp, value)
        }
        Hook::Reblock => {
            // SAFETY: as above.
            unsafe { table::slot_mut(slot).state = ProcState::Blocked };
            cpu.set_current(None);
            schedule_next()
        }
    }
}

/// Finish the operation `slot` was blocked on. Runs with the target's
/// address space active.
fn post_switch(slot: usize) -> Hook {
    // SAFETY: this core owns the freshly-switched-to slot.
    let proc = unsafe { table::slot_mut(slot) };
    let root = proc.effective_root();

    match proc.pending {
        PendingOp::None => {
            if proc.fresh {
                Hook::FirstRun
            } else {
                // Resolved by the waker; the return value is staged.
                let v = proc.pending_ret;
                proc.pending_ret = 0;
                Hook::Return(v)
            }
        }

        PendingOp::Sleep => {
            if crate::timer::ticks() >= proc.sleep_until {
                proc.pending = PendingOp::None;
                Hook::Return(0)
            } else {
                Hook::Reblock
            }
        }

        PendingOp::ConsoleRead { buf, len } => {
            match attempt_console_read(slot, buf, len) {
                Some(n) => {
                    proc.pending = PendingOp::None;
                    Hook::Return(n)
                }
                None => Hook::Reblock,
            }
        }

        PendingOp::PipeRead { pipe, buf, len } => match attempt_pipe_read(slot, pipe, buf, len) {
            Some(n) => {
                proc.pending = PendingOp::None;
                Hook::Return(n)
            }
            None => Hook::Reblock,
        },

        PendingOp::PipeWrite { pipe, buf, len } => {
            match attempt_pipe_write(slot, pipe, buf, len) {
                Some(n) => {
                    proc.pending = PendingOp::None;
                    Hook::Return(n)
                }
                None => Hook::Reblock,
            }
        }

        PendingOp::Wait => {
            let target = proc.waiting_for.unwrap_or(WaitTarget::AnyChild);
            match crate::process::lifecycle::reap_zombie(slot, target) {
                Some((_pid, status)) => {
                    proc.pending = PendingOp::None;
                    proc.waiting_for = None;
                    Hook::Return(status)
                }
                None => Hook::Reblock,
            }
        }

        // Server replied to a read: raw bytes into the read buffer.
        PendingOp::Read { buf, len, .. } => match proc.ipc_pending_msg.take() {
            Some(msg) => {
                let n = msg.data_len.min(len);
                let _ = paging::copy_to_space(root, buf, &msg.data[..n]);
                proc.pending = PendingOp::None;
                Hook::Return(n as u64)
            }
            None => Hook::Reblock,
        },

        // Server replied to a stat: reply bytes (≤64) into the stat
        // buffer.
        PendingOp::Stat { buf, len } => match proc.ipc_pending_msg.take() {
            Some(msg) => {
                let n = msg.data_len.min(len).min(64);
                let _ = paging::copy_to_space(root, buf, &msg.data[..n]);
                proc.pending = PendingOp::None;
                Hook::Return(n as u64)
            }
            None => Hook::Reblock,
        },

        // Raw IPC delivery: the tagged message shape.
        PendingOp::IpcRecv { buf, .. } => match proc.ipc_pending_msg.take() {
            Some(msg) => {
                let user = UserMessage::from_message(&msg);
                // SAFETY: UserMessage is repr(C) plain bytes.
                let bytes = unsafe {
                    core::slice::from_raw_parts(
                        (&user as *const UserMessage).cast::<u8>(),
                        UserMessage::SIZE,
                    )
                };
                let _ = paging::copy_to_space(root, buf, bytes);
                proc.pending = PendingOp::None;
                Hook::Return(msg.data_len as u64)
            }
            None => Hook::Reblock,
        },

        // open/create/write/close/remove replies are resolved entirely by
        // `ipc_reply` (plain integer returns); it stages the value and
        // clears the op, so reaching here means the reply is still
        // outstanding.
        PendingOp::Open { .. }
        | PendingOp::Create { .. }
        | PendingOp::Write { .. }
        | PendingOp::Close { .. }
        | PendingOp::Remove => Hook::Reblock,

        // The network stack is an external collaborator; wakers set the
        // return value before marking ready.
        PendingOp::NetConnect | PendingOp::NetListen | PendingOp::DnsQuery => {
            proc.pending = PendingOp::None;
            let v = proc.pending_ret;
            proc.pending_ret = 0;
            Hook::Return(v)
        }
        PendingOp::NetRead { .. } | PendingOp::IcmpRead { .. } => {
            proc.pending = PendingOp::None;
            Hook::Return(Errno::Enosys.as_u64())
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer attempts, shared by the syscall fast paths and the hook
// ---------------------------------------------------------------------------

/// Try to satisfy a console read from the VT input ring. `None` means no
/// input; the caller blocks (the waiter is registered here).
pub fn attempt_console_read(slot: usize, buf: u64, len: usize) -> Option<u64> {
    // SAFETY: this core owns `slot` (syscall or post-switch path).
    let proc = unsafe { table::slot_mut(slot) };
    let root = proc.effective_root();
    let vt = proc.vt;
    let mut tmp = [0u8; 256];
    let want = len.min(tmp.len());
    let n = crate::drivers::console::read_input(vt, &mut tmp[..want]);
    if n == 0 {
        crate::drivers::console::add_waiter(vt, proc.pid);
        return None;
    }
    let _ = paging::copy_to_space(root, buf, &tmp[..n]);
    Some(n as u64)
}

/// Try a pipe read. `None` = empty-with-writers (waiter registered).
pub fn attempt_pipe_read(slot: usize, pipe_id: usize, buf: u64, len: usize) -> Option<u64> {
    // SAFETY: this core owns `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    let root = proc.effective_root();
    let pid = proc.pid;

    let mut woken = [0u64; pipe::PIPE_WAITERS];
    let mut n_woken = 0;
    let result;
    {
        let Ok(mut p) = pipe::lock(pipe_id) else {
            return Some(0); // pipe gone: EOF
        };
        let mut total = 0usize;
        let mut tmp = [0u8; 512];
        loop {
            let want = (len - total).min(tmp.len());
            if want == 0 {
                break;
            }
            match p.read(&mut tmp[..want]) {
                pipe::ReadOutcome::Bytes(n) => {
                    let _ = paging::copy_to_space(root, buf + total as u64, &tmp[..n]);
                    total += n;
                }
                pipe::ReadOutcome::WouldBlock if total == 0 => {
                    p.read_waiters.add(pid);
                    return None;
                }
                pipe::ReadOutcome::WouldBlock => break,
                pipe::ReadOutcome::Eof => break,
            }
        }
        if total > 0 {
            n_woken = p.write_waiters.drain(&mut woken);
        }
        result = total as u64;
    }
    for &w in &woken[..n_woken] {
        wake_pid(w);
    }
    Some(result)
}

/// Try a pipe write. `None` = full-with-readers (waiter registered).
/// Broken pipe returns the EIO sentinel.
pub fn attempt_pipe_write(slot: usize, pipe_id: usize, buf: u64, len: usize) -> Option<u64> {
    // SAFETY: this core owns `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    let root = proc.effective_root();
    let pid = proc.pid;

    let mut woken = [0u64; pipe::PIPE_WAITERS];
    let mut n_woken = 0;
    let result;
    {
        let Ok(mut p) = pipe::lock(pipe_id) else {
            return Some(Errno::Eio.as_u64());
        };
        let mut total = 0usize;
        let mut tmp = [0u8; 512];
        loop {
            let want = (len - total).min(tmp.len());
            if want == 0 {
                break;
            }
            if paging::copy_from_space(root, buf + total as u64, &mut tmp[..want]).is_err() {
                break;
            }
            match p.write(&tmp[..want]) {
                pipe::WriteOutcome::Bytes(n) => {
                    total += n;
                    if n < want {
                        break; // ring filled
                    }
                }
                pipe::WriteOutcome::WouldBlock if total == 0 => {
                    p.write_waiters.add(pid);
                    return None;
                }
                pipe::WriteOutcome::WouldBlock => break,
                pipe::WriteOutcome::Broken => {
                    if total == 0 {
                        return Some(Errno::Eio.as_u64());
                    }
                    break;
                }
            }
        }
        if total > 0 {
            n_woken = p.read_waiters.drain(&mut woken);
        }
        result = total as u64;
    }
    for &w in &woken[..n_woken] {
        wake_pid(w);
    }
    Some(result)
}
