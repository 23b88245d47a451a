// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-task scheduler counters from procfs.
//!
//! `schedstat` comes through the procfs crate. `core_forceidle_sum` only
//! exists in the free-form `/proc/<pid>/sched` dump and is parsed here.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use procfs::process::{Process, Schedstat};

use crate::clock::NSEC_PER_MSEC;

pub const PROC_ROOT: &str = "/proc";

const FORCEIDLE_KEY: &str = "core_forceidle_sum";

/// `/proc/<pid>/schedstat`: time on cpu, time waiting on a runqueue, and
/// number of timeslices run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStat {
    pub cpu_time_ns: u64,
    pub runq_wait_ns: u64,
    pub timeslices: u64,
}

impl From<Schedstat> for SchedStat {
    fn from(s: Schedstat) -> Self {
        Self {
            cpu_time_ns: s.sum_exec_runtime,
            runq_wait_ns: s.run_delay,
            timeslices: s.pcount,
        }
    }
}

/// One sample of everything reported for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSample {
    pub schedstat: SchedStat,
    pub forceidle_ns: u64,
}

/// Parse the `core_forceidle_sum` entry of `/proc/<pid>/sched`. The kernel
/// prints it in milliseconds with a six digit fraction. Kernels built
/// without core scheduling don't have the entry at all, which reads as 0.
pub fn parse_forceidle(sched: &str) -> Result<u64> {
    let Some(line) = sched
        .lines()
        .find(|l| l.trim_start().starts_with(FORCEIDLE_KEY))
    else {
        return Ok(0);
    };

    let Some((_, val)) = line.split_once(':') else {
        bail!("Malformed {} line {:?}", FORCEIDLE_KEY, line);
    };
    let val = val.trim();
    let (ms, frac) = val.split_once('.').unwrap_or((val, ""));
    let ms: u64 = ms
        .parse()
        .with_context(|| format!("Malformed {} value {:?}", FORCEIDLE_KEY, val))?;

    let mut digits: String = frac.chars().take(6).collect();
    while digits.len() < 6 {
        digits.push('0');
    }
    let ns: u64 = digits
        .parse()
        .with_context(|| format!("Malformed {} value {:?}", FORCEIDLE_KEY, val))?;

    Ok(ms * NSEC_PER_MSEC + ns)
}

/// Samples tasks under a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcStats {
    root: PathBuf,
}

impl Default for ProcStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcStats {
    pub fn new() -> Self {
        Self::with_root(PROC_ROOT)
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    pub fn schedstat(&self, pid: i32) -> Result<SchedStat> {
        let process = Process::new_with_root(self.pid_dir(pid))
            .with_context(|| format!("Failed to open process {}", pid))?;
        let stat = process
            .schedstat()
            .with_context(|| format!("Failed to read schedstat of {}", pid))?;
        Ok(stat.into())
    }

    pub fn forceidle_ns(&self, pid: i32) -> Result<u64> {
        let path = self.pid_dir(pid).join("sched");
        let sched = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_forceidle(&sched).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn sample(&self, pid: i32) -> Result<TaskSample> {
        Ok(TaskSample {
            schedstat: self.schedstat(pid)?,
            forceidle_ns: self.forceidle_ns(pid)?,
        })
    }
}
