// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # schtest
//!
//! A core scheduling test harness. A run forks groups of workload commands,
//! optionally gives them core scheduling cookies and places them in a
//! cgroup, waits for them to finish or interrupts them once a deadline
//! passes, and writes per-task scheduler statistics next to the CPU
//! sibling topology they ran on.

pub mod cgroup;
pub mod clock;
pub mod config;
pub mod cookie;
pub mod report;
pub mod run;
pub mod schedstat;
pub mod spawn;
pub mod task;
pub mod topology;
pub mod waiter;

pub use config::RunConfig;
pub use cookie::CookieMode;
pub use run::{run, RunOutcome};
pub use task::{TaskGroup, TaskSpec};
pub use topology::{CpuSetSpec, CpuTopology};
