// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host scheduling shims: CPU pinning for the poll threads, current-CPU
//! queries for transmit steering, and the preempt guard taken across a
//! transmit submission.

use std::io;
use std::marker::PhantomData;

#[cfg(target_os = "linux")]
mod sys {
    use std::io;

    /// Pins the current thread to the single CPU `cpu`.
    pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
        // SAFETY: zeroed cpu_set_t is a valid empty set, and the set/len
        // pair passed to the syscall matches.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Returns the CPU the current thread was running on during the call.
    pub fn current_cpu() -> usize {
        // SAFETY: no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 { 0 } else { cpu as usize }
    }

    /// Returns the number of CPUs in the current thread's affinity set.
    pub fn num_cpus() -> usize {
        // SAFETY: zeroed cpu_set_t is a valid empty set, and the set/len
        // pair passed to the syscall matches.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), &mut set) < 0 {
                return 1;
            }
            (libc::CPU_COUNT(&set) as usize).max(1)
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;

    pub fn pin_current_thread(_cpu: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn current_cpu() -> usize {
        0
    }

    pub fn num_cpus() -> usize {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    sys::pin_current_thread(cpu)
}

pub fn current_cpu() -> usize {
    sys::current_cpu()
}

pub fn num_cpus() -> usize {
    sys::num_cpus()
}

/// Guard modeling the guest scheduler's preempt-disable primitive.
///
/// The CPU captured at construction stays the submission target for the
/// guard's lifetime, so a transmit lands on one queue even if the host
/// migrates the thread mid-call. Not `Send`: the choice is only meaningful
/// on the thread that made it.
pub struct PreemptGuard {
    cpu: usize,
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

pub fn preempt_disable() -> PreemptGuard {
    PreemptGuard {
        cpu: current_cpu(),
        _not_send: PhantomData,
    }
}
