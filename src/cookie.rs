// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Core scheduling cookies
//!
//! Tasks that share a core scheduling cookie may run on sibling hardware
//! threads of the same core at the same time; tasks with different cookies
//! may not. The first `n` tasks of a run are donors: the parent creates a
//! fresh cookie for each of them once it knows their pid. Every later task
//! `i` copies the cookie of donor `i % n` from inside its own process before
//! it execs.
//!
//! Donors and recipients each arrive at a [`CookieBarrier`] once their cookie
//! is in place. The parent holds the run until the barrier clears.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::unistd::Pid;

use crate::clock::{now_ns, sleep_ms, NSEC_PER_MSEC};

const PR_SCHED_CORE: libc::c_int = 62;
const PR_SCHED_CORE_GET: libc::c_ulong = 0;
const PR_SCHED_CORE_CREATE: libc::c_ulong = 1;
const PR_SCHED_CORE_SHARE_FROM: libc::c_ulong = 3;

// PIDTYPE_PID, i.e. only the thread named by pid.
const PR_SCHED_CORE_SCOPE_THREAD: libc::c_ulong = 0;

pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(1);
const BARRIER_POLL_MS: u64 = 1;

fn sched_core(op: libc::c_ulong, pid: Pid, arg: libc::c_ulong) -> nix::Result<()> {
    let ret = unsafe {
        libc::prctl(
            PR_SCHED_CORE,
            op,
            pid.as_raw() as libc::c_ulong,
            PR_SCHED_CORE_SCOPE_THREAD,
            arg,
        )
    };
    Errno::result(ret).map(drop)
}

/// Give `pid` a new cookie of its own.
pub fn sched_core_create(pid: Pid) -> nix::Result<()> {
    sched_core(PR_SCHED_CORE_CREATE, pid, 0)
}

/// Move the calling thread into the cookie of `pid`.
pub fn sched_core_share_from(pid: Pid) -> nix::Result<()> {
    sched_core(PR_SCHED_CORE_SHARE_FROM, pid, 0)
}

pub fn sched_core_get(pid: Pid) -> nix::Result<u64> {
    let mut cookie: u64 = 0;
    sched_core(
        PR_SCHED_CORE_GET,
        pid,
        &mut cookie as *mut u64 as libc::c_ulong,
    )?;
    Ok(cookie)
}

/// How cookies are assigned for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CookieMode {
    #[default]
    Disabled,
    /// Kernel cookies shared across `n` donors.
    Real(usize),
    /// Synthetic values laid out like `Real(n)` without touching the kernel.
    Fake(usize),
}

impl CookieMode {
    pub fn new(count: usize, fake: bool) -> Self {
        match (count, fake) {
            (0, _) => Self::Disabled,
            (n, false) => Self::Real(n),
            (n, true) => Self::Fake(n),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Real(n) | Self::Fake(n) => *n,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.count() > 0
    }

    pub fn is_donor(&self, index: usize) -> bool {
        index < self.count()
    }

    /// Index of the donor whose cookie task `index` ends up with.
    pub fn donor_of(&self, index: usize) -> Option<usize> {
        match self.count() {
            0 => None,
            n => Some(index % n),
        }
    }

    pub fn fake_cookie(&self, index: usize) -> u64 {
        match self.donor_of(index) {
            Some(donor) => donor as u64 + 1,
            None => 0,
        }
    }
}

/// Countdown shared with every child through an anonymous shared mapping.
///
/// Initialized to the number of tasks. Each task owns exactly one unit and
/// calls [`arrive`](Self::arrive) once, either from the parent (donors) or
/// from its own process (recipients and fake cookies). No lock is needed.
pub struct CookieBarrier {
    ptr: NonNull<AtomicI32>,
}

impl CookieBarrier {
    pub fn new(count: usize) -> Result<Self> {
        let count = i32::try_from(count).context("Too many tasks for the cookie barrier")?;
        let len = NonZeroUsize::new(std::mem::size_of::<AtomicI32>())
            .context("Zero sized cookie barrier")?;

        let addr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .context("Failed to map shared memory for the cookie barrier")?;

        let ptr = addr.cast::<AtomicI32>();
        unsafe { ptr.as_ptr().write(AtomicI32::new(count)) };
        Ok(Self { ptr })
    }

    fn counter(&self) -> &AtomicI32 {
        // Mapped for the life of self.
        unsafe { self.ptr.as_ref() }
    }

    pub fn remaining(&self) -> i32 {
        self.counter().load(Ordering::SeqCst)
    }

    /// Async-signal-safe, callable between fork and exec.
    pub fn arrive(&self) {
        self.counter().fetch_sub(1, Ordering::SeqCst);
    }

    /// Poll until every task has arrived or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = now_ns()? + timeout.as_millis() as u64 * NSEC_PER_MSEC;
        loop {
            let remaining = self.remaining();
            if remaining <= 0 {
                return Ok(());
            }
            if now_ns()? >= deadline {
                bail!(
                    "Timed out waiting for cookies, {} tasks never finished cookie setup",
                    remaining
                );
            }
            sleep_ms(BARRIER_POLL_MS);
        }
    }
}

impl Drop for CookieBarrier {
    fn drop(&mut self) {
        let len = std::mem::size_of::<AtomicI32>();
        let _ = unsafe { munmap(self.ptr.cast(), len) };
    }
}

/// Create the cookie of donor `index` from the parent, then arrive for it.
pub fn create_cookie(index: usize, pid: Pid, barrier: &CookieBarrier) -> Result<u64> {
    sched_core_create(pid)
        .with_context(|| format!("Failed to create cookie for task {} with pid {}", index, pid))?;
    let cookie = sched_core_get(pid)
        .with_context(|| format!("Failed to get cookie for task {} with pid {}", index, pid))?;
    barrier.arrive();
    info!("Cookie for task {} with pid {} is {:#x}", index, pid, cookie);
    Ok(cookie)
}

/// Take the cookie of `donor` into the calling process, then arrive for it.
/// Runs in a freshly forked child, so it only makes raw syscalls.
pub fn copy_cookie(donor: Pid, barrier: &CookieBarrier) -> nix::Result<u64> {
    sched_core_share_from(donor)?;
    let cookie = sched_core_get(Pid::from_raw(0))?;
    barrier.arrive();
    Ok(cookie)
}
