// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use nix::unistd::Pid;

use crate::schedstat::TaskSample;

/// A command line run `count` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    command: String,
    count: usize,
}

impl TaskGroup {
    pub fn new(command: &str, count: usize) -> Result<Self> {
        if command.split_whitespace().next().is_none() {
            bail!("Empty task command");
        }
        if count == 0 {
            bail!("Task {:?} has a count of 0", command);
        }
        Ok(Self {
            command: command.to_string(),
            count,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// The command split on whitespace into program and arguments.
    pub fn args(&self) -> Vec<String> {
        self.command.split_whitespace().map(String::from).collect()
    }
}

/// Every task group of a run, in command line order. Task indices are
/// assigned by walking the groups and their replicas in this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSpec {
    groups: Vec<TaskGroup>,
}

impl TaskSpec {
    pub fn new(groups: Vec<TaskGroup>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    pub fn nr_tasks(&self) -> usize {
        self.groups.iter().map(|g| g.count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nr_tasks() == 0
    }

    /// The group of every task, indexed by task index.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskGroup> {
        self.groups
            .iter()
            .flat_map(|g| std::iter::repeat(g).take(g.count()))
    }
}

pub fn output_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("fork_{:03}.txt", index))
}

/// Raw `wait(2)` status of a terminated task.
pub type RawStatus = i32;

/// State of one forked task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub index: usize,
    pub pid: Pid,
    pub cookie: u64,
    pub running: bool,
    /// Most recent counter sample. Taken at termination, or at escalation
    /// if the task was interrupted.
    pub sample: TaskSample,
    pub stop_ns: u64,
    pub status: RawStatus,
}

impl TaskInfo {
    pub fn new(index: usize, pid: Pid) -> Self {
        Self {
            index,
            pid,
            cookie: 0,
            running: true,
            sample: TaskSample::default(),
            stop_ns: 0,
            status: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_indices_follow_groups() {
        let spec = TaskSpec::new(vec![
            TaskGroup::new("true", 2).unwrap(),
            TaskGroup::new("sleep 1", 1).unwrap(),
            TaskGroup::new("false", 3).unwrap(),
        ]);
        assert_eq!(spec.nr_tasks(), 6);
        let cmds: Vec<&str> = spec.tasks().map(|g| g.command()).collect();
        assert_eq!(
            cmds,
            vec!["true", "true", "sleep 1", "false", "false", "false"]
        );
    }

    #[test]
    fn test_task_group_args() {
        let g = TaskGroup::new("  stress-ng  --cpu 4 ", 1).unwrap();
        assert_eq!(g.args(), vec!["stress-ng", "--cpu", "4"]);
        assert!(TaskGroup::new("   ", 1).is_err());
        assert!(TaskGroup::new("true", 0).is_err());
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("/tmp/r"), 7),
            PathBuf::from("/tmp/r/fork_007.txt")
        );
        assert_eq!(
            output_path(Path::new("."), 1234),
            PathBuf::from("./fork_1234.txt")
        );
    }
}
