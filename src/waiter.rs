// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Waiting for tasks
//!
//! SIGCHLD is blocked for the whole run and read from a signalfd instead.
//! Every wakeup, whether from a signal, the deadline or the periodic reap
//! interval, checks each running task with a non-reaping `waitid()`. A
//! terminated task is sampled while it is still a zombie, then reaped and
//! written to the report.
//!
//! When the deadline passes, running tasks are sampled, sent SIGINT and
//! given a grace period. Still having tasks when that runs out fails the
//! run.

use std::io::Write;
use std::os::fd::AsFd;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};

use crate::clock::{now_ns, ns_to_secs, NSEC_PER_MSEC};
use crate::report::Report;
use crate::schedstat::ProcStats;
use crate::spawn::TaskSet;
use crate::task::{RawStatus, TaskInfo};

/// Upper bound on how long a wakeup can be missed. SIGCHLD coalesces and,
/// with other threads around, may be delivered somewhere else entirely.
const REAP_INTERVAL_MS: u64 = 100;

fn sigchld_mask() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask
}

/// Keeps SIGCHLD blocked on the calling thread while alive.
pub struct SigchldBlock {
    old: SigSet,
}

impl SigchldBlock {
    pub fn new() -> Result<Self> {
        let old = sigchld_mask()
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .context("Failed to block SIGCHLD")?;
        Ok(Self { old })
    }

    /// The mask in effect before blocking, for children to restore.
    pub fn old_mask(&self) -> &SigSet {
        &self.old
    }
}

impl Drop for SigchldBlock {
    fn drop(&mut self) {
        if let Err(e) = self.old.thread_set_mask() {
            warn!("Failed to restore signal mask: {}", e);
        }
    }
}

/// Encode a terminal wait status the way `wait(2)` reports it.
pub fn raw_status(status: WaitStatus) -> Option<RawStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some((code & 0xff) << 8),
        WaitStatus::Signaled(_, sig, core) => Some(sig as i32 | if core { 0x80 } else { 0 }),
        _ => None,
    }
}

pub struct Waiter<'a, W: Write> {
    tasks: &'a mut TaskSet,
    report: &'a mut Report<W>,
    proc_stats: ProcStats,
    grace: Duration,
    escalated: bool,
}

impl<'a, W: Write> Waiter<'a, W> {
    pub fn new(tasks: &'a mut TaskSet, report: &'a mut Report<W>, grace: Duration) -> Self {
        Self {
            tasks,
            report,
            proc_stats: ProcStats::new(),
            grace,
            escalated: false,
        }
    }

    pub fn escalated(&self) -> bool {
        self.escalated
    }

    /// Wait for every task to terminate. `start_ns` plus `duration` is the
    /// deadline for escalation, no duration waits forever. SIGCHLD must be
    /// blocked on this thread.
    pub fn run(&mut self, start_ns: u64, duration: Option<Duration>) -> Result<()> {
        let sfd = SignalFd::with_flags(
            &sigchld_mask(),
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )
        .context("Failed to create signalfd")?;

        let mut deadline = duration.map(|d| start_ns + d.as_nanos() as u64);

        self.reap()?;
        while self.tasks.nr_running() > 0 {
            let mut timeout_ms = REAP_INTERVAL_MS;
            if let Some(deadline) = deadline {
                let left = deadline.saturating_sub(now_ns()?);
                timeout_ms = timeout_ms.min(left.div_ceil(NSEC_PER_MSEC));
            }

            let mut fds = [PollFd::new(sfd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(timeout_ms as u16)) {
                Ok(n) if n > 0 => self.drain_signals(&sfd)?,
                Ok(_) => {}
                Err(e) => return Err(e).context("Failed to wait for SIGCHLD"),
            }

            self.reap()?;
            if self.tasks.nr_running() == 0 {
                break;
            }

            if let Some(at) = deadline {
                if now_ns()? >= at {
                    if self.escalated {
                        bail!(
                            "timed out waiting for children, {} still running",
                            self.tasks.nr_running()
                        );
                    }
                    self.escalate();
                    deadline = Some(now_ns()? + self.grace.as_nanos() as u64);
                }
            }
        }

        Ok(())
    }

    fn drain_signals(&mut self, sfd: &SignalFd) -> Result<()> {
        loop {
            let Some(info) = sfd.read_signal().context("Failed to read signalfd")? else {
                return Ok(());
            };
            if info.ssi_signo != Signal::SIGCHLD as u32 {
                bail!("Unexpected signal {} while waiting for tasks", info.ssi_signo);
            }
            let pid = nix::unistd::Pid::from_raw(info.ssi_pid as i32);
            match self.tasks.find(pid) {
                Some(task) => debug!("SIGCHLD from task {} pid {}", task.index, pid),
                None => bail!("SIGCHLD from unknown pid {}", pid),
            }
        }
    }

    /// Collect every task that has terminated since the last pass.
    fn reap(&mut self) -> Result<()> {
        for i in 0..self.tasks.len() {
            let task = &self.tasks.tasks()[i];
            if !task.running {
                continue;
            }
            let pid = task.pid;
            let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
            match waitid(Id::Pid(pid), flags) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(_) => self.finish(i)?,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to check task pid {}", pid));
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, i: usize) -> Result<()> {
        let proc_stats = &self.proc_stats;
        let task = &mut self.tasks.tasks_mut()[i];
        task.stop_ns = now_ns()?;
        match proc_stats.sample(task.pid.as_raw()) {
            Ok(sample) => task.sample = sample,
            Err(e) => warn!("Failed to sample task {}: {:#}", task.index, e),
        }

        let status = waitpid(task.pid, None)
            .with_context(|| format!("Failed to reap task {} pid {}", task.index, task.pid))?;
        let Some(raw) = raw_status(status) else {
            bail!("Unexpected wait status {:?} for task {}", status, task.index);
        };
        task.status = raw;
        task.running = false;

        log_completion(task);
        self.report.write_task(task)
    }

    /// Sample and SIGINT every running task.
    fn escalate(&mut self) {
        self.escalated = true;
        info!(
            "Deadline passed, interrupting {} tasks",
            self.tasks.nr_running()
        );
        let proc_stats = &self.proc_stats;
        for task in self.tasks.tasks_mut().iter_mut().filter(|t| t.running) {
            match proc_stats.sample(task.pid.as_raw()) {
                Ok(sample) => task.sample = sample,
                Err(e) => debug!("Failed to sample task {}: {:#}", task.index, e),
            }
            match kill(task.pid, Signal::SIGINT) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to interrupt task {} pid {}: {}", task.index, task.pid, e),
            }
        }
    }
}

fn log_completion(task: &TaskInfo) {
    info!(
        "Task {} completed, status={}, cpu_time_s={:.6}, runq_wait_time_s={:.6}, forceidle_time_s={:.6}",
        task.pid,
        task.status,
        ns_to_secs(task.sample.schedstat.cpu_time_ns),
        ns_to_secs(task.sample.schedstat.runq_wait_ns),
        ns_to_secs(task.sample.forceidle_ns),
    );
}
