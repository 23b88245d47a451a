// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One complete run: topology, cookies, fork, cgroup placement, wait and
//! report, in that order.

use anyhow::Result;
use log::info;

use crate::cgroup::Cgroup;
use crate::clock::now_ns;
use crate::config::{prepare_dir, RunConfig};
use crate::cookie::{CookieBarrier, BARRIER_TIMEOUT};
use crate::report::{Report, Summary};
use crate::spawn::spawn_tasks;
use crate::task::{output_path, TaskInfo};
use crate::topology::CpuTopology;
use crate::waiter::{SigchldBlock, Waiter};

#[derive(Debug)]
pub struct RunOutcome {
    /// Every task in index order.
    pub tasks: Vec<TaskInfo>,
    pub ready_ns: u64,
    pub done_ns: u64,
    /// Whether the deadline passed and tasks had to be interrupted.
    pub escalated: bool,
}

impl RunOutcome {
    pub fn summary(&self) -> Summary {
        Summary::new(&self.tasks, self.ready_ns, self.done_ns)
    }
}

pub fn run(cfg: &RunConfig) -> Result<RunOutcome> {
    cfg.validate()?;
    prepare_dir(&cfg.dir)?;

    for (index, group) in cfg.tasks.tasks().enumerate() {
        info!(
            "{}: {} > {} 2>&1",
            index,
            group.command(),
            output_path(&cfg.dir, index).display()
        );
    }

    info!("Fetching topology");
    let topology = CpuTopology::discover_with_path(&cfg.cpu_set, &cfg.sysfs)?;
    info!(
        "{} cpus in {} sibling groups",
        topology.nr_cpus(),
        topology.nr_groups()
    );

    let cgroup = match &cfg.cgroup {
        Some(path) => Some(Cgroup::open_or_create(path)?),
        None => None,
    };

    let barrier = if cfg.cookies.is_enabled() {
        info!("Creating shared memory");
        Some(CookieBarrier::new(cfg.nr_tasks())?)
    } else {
        None
    };

    let sigchld = SigchldBlock::new()?;
    let mut tasks = spawn_tasks(cfg, barrier.as_ref(), sigchld.old_mask())?;

    if let Some(cgroup) = &cgroup {
        info!("Setting up cgroup {}", cgroup.path().display());
        cgroup.set_cpus(&cfg.cpu_set)?;
        cgroup.add_procs(&tasks.pids())?;
    }

    let mut ready_ns = now_ns()?;
    if let Some(barrier) = &barrier {
        info!("Waiting for cookies");
        barrier.wait(BARRIER_TIMEOUT)?;
        ready_ns = now_ns()?;
    }

    let mut report = Report::create(&cfg.dir)?;
    report.write_header(&cfg.cpu_set, &topology, cfg.nr_tasks())?;

    info!("Waiting for tasks");
    let mut waiter = Waiter::new(&mut tasks, &mut report, cfg.grace);
    waiter.run(ready_ns, cfg.duration)?;
    let escalated = waiter.escalated();

    let done_ns = now_ns()?;
    report.write_footer(ready_ns, done_ns)?;

    Ok(RunOutcome {
        tasks: tasks.into_tasks(),
        ready_ns,
        done_ns,
        escalated,
    })
}
