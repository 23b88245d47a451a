// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Results file
//!
//! `out.txt` is line oriented, all fields space separated:
//!
//! ```text
//! <cpu set, or "empty">
//! <sibling group count>
//! <cpus of group 0>
//! ...
//! <task count>
//! <index> <pid> <cookie> <stop ns> <status> <cpu ns> <runq wait ns> <forceidle ns>
//! ...
//! <ready ns> <done ns>
//! ```
//!
//! Task lines are written as tasks terminate, so they are in completion
//! order rather than index order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::clock::ns_to_secs;
use crate::task::TaskInfo;
use crate::topology::{CpuSetSpec, CpuTopology};

pub const RESULTS_FILE: &str = "out.txt";

pub struct Report<W: Write> {
    out: W,
}

impl Report<BufWriter<File>> {
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(RESULTS_FILE);
        let f = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self::new(BufWriter::new(f)))
    }
}

impl<W: Write> Report<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_header(
        &mut self,
        cpu_set: &CpuSetSpec,
        topo: &CpuTopology,
        nr_tasks: usize,
    ) -> Result<()> {
        writeln!(self.out, "{}", cpu_set)?;
        writeln!(self.out, "{}", topo.nr_groups())?;
        for group in topo.groups() {
            let cpus: Vec<String> = group.iter().map(|c| c.to_string()).collect();
            writeln!(self.out, "{}", cpus.join(" "))?;
        }
        writeln!(self.out, "{}", nr_tasks)?;
        Ok(())
    }

    pub fn write_task(&mut self, task: &TaskInfo) -> Result<()> {
        writeln!(
            self.out,
            "{} {} {} {} {} {} {} {}",
            task.index,
            task.pid,
            task.cookie,
            task.stop_ns,
            task.status,
            task.sample.schedstat.cpu_time_ns,
            task.sample.schedstat.runq_wait_ns,
            task.sample.forceidle_ns,
        )?;
        self.out.flush()?;
        Ok(())
    }

    pub fn write_footer(&mut self, ready_ns: u64, done_ns: u64) -> Result<()> {
        writeln!(self.out, "{} {}", ready_ns, done_ns)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Total, mean and sample standard deviation of one per-task counter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stat {
    pub total: f64,
    pub mean: f64,
    pub stdev: f64,
}

impl Stat {
    fn from_secs(values: &[f64]) -> Self {
        let Some(nr) = values.len().checked_sub(1) else {
            return Self::default();
        };
        let total: f64 = values.iter().sum();
        let mean = total / values.len() as f64;
        let stdev = match nr {
            0 => 0.0,
            nr => {
                let sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
                (sq / nr as f64).sqrt()
            }
        };
        Self { total, mean, stdev }
    }
}

/// Aggregates over every task of a finished run, in seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub nr_tasks: usize,
    pub nr_failed: usize,
    pub elapsed_s: f64,
    pub cpu_time: Stat,
    pub runq_wait: Stat,
    pub forceidle: Stat,
}

impl Summary {
    pub fn new(tasks: &[TaskInfo], ready_ns: u64, done_ns: u64) -> Self {
        let secs = |f: fn(&TaskInfo) -> u64| -> Stat {
            let vals: Vec<f64> = tasks.iter().map(|t| ns_to_secs(f(t))).collect();
            Stat::from_secs(&vals)
        };
        Self {
            nr_tasks: tasks.len(),
            nr_failed: tasks.iter().filter(|t| t.status != 0).count(),
            elapsed_s: ns_to_secs(done_ns.saturating_sub(ready_ns)),
            cpu_time: secs(|t| t.sample.schedstat.cpu_time_ns),
            runq_wait: secs(|t| t.sample.schedstat.runq_wait_ns),
            forceidle: secs(|t| t.sample.forceidle_ns),
        }
    }

    pub fn log(&self) {
        info!(
            "{} tasks ({} non-zero exits) in {:.3}s",
            self.nr_tasks, self.nr_failed, self.elapsed_s
        );
        for (name, stat) in [
            ("cpu_time", &self.cpu_time),
            ("runq_wait", &self.runq_wait),
            ("forceidle", &self.forceidle),
        ] {
            info!(
                "{:>10}: total={:.6}s mean={:.6}s stdev={:.6}s",
                name, stat.total, stat.mean, stat.stdev
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedstat::{SchedStat, TaskSample};
    use nix::unistd::Pid;
    use std::collections::BTreeSet;

    fn task(index: usize, cpu_ns: u64, status: i32) -> TaskInfo {
        let mut t = TaskInfo::new(index, Pid::from_raw(100 + index as i32));
        t.cookie = 7;
        t.running = false;
        t.stop_ns = 5000 + index as u64;
        t.status = status;
        t.sample = TaskSample {
            schedstat: SchedStat {
                cpu_time_ns: cpu_ns,
                runq_wait_ns: 10,
                timeslices: 1,
            },
            forceidle_ns: 3,
        };
        t
    }

    #[test]
    fn test_report_layout() {
        let topo = CpuTopology::from_groups(vec![
            BTreeSet::from([0, 1]),
            BTreeSet::from([2, 3]),
        ]);
        let mut report = Report::new(Vec::new());
        report
            .write_header(&CpuSetSpec::parse("0-3").unwrap(), &topo, 2)
            .unwrap();
        report.write_task(&task(1, 200, 256)).unwrap();
        report.write_task(&task(0, 100, 0)).unwrap();
        report.write_footer(4000, 6000).unwrap();

        let out = String::from_utf8(report.into_inner()).unwrap();
        assert_eq!(
            out,
            "0-3\n2\n0 1\n2 3\n2\n\
             1 101 7 5001 256 200 10 3\n\
             0 100 7 5000 0 100 10 3\n\
             4000 6000\n"
        );
    }

    #[test]
    fn test_report_empty_cpu_set() {
        let mut report = Report::new(Vec::new());
        report
            .write_header(&CpuSetSpec::default(), &CpuTopology::default(), 0)
            .unwrap();
        let out = String::from_utf8(report.into_inner()).unwrap();
        assert_eq!(out, "empty\n0\n0\n");
    }

    #[test]
    fn test_stat_from_secs() {
        assert_eq!(Stat::from_secs(&[]), Stat::default());
        assert_eq!(
            Stat::from_secs(&[2.0]),
            Stat {
                total: 2.0,
                mean: 2.0,
                stdev: 0.0,
            }
        );

        let s = Stat::from_secs(&[1.0, 3.0]);
        assert_eq!(s.total, 4.0);
        assert_eq!(s.mean, 2.0);
        assert!((s.stdev - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_summary() {
        let tasks = vec![task(0, 1_000_000_000, 0), task(1, 3_000_000_000, 256)];
        let s = Summary::new(&tasks, 1_000_000_000, 3_500_000_000);
        assert_eq!(s.nr_tasks, 2);
        assert_eq!(s.nr_failed, 1);
        assert_eq!(s.elapsed_s, 2.5);
        assert_eq!(s.cpu_time.total, 4.0);
        assert_eq!(s.cpu_time.mean, 2.0);
    }
}
