// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cookie::CookieMode;
use crate::task::TaskSpec;
use crate::topology::{CpuSetSpec, SYSFS_CPU_ROOT};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// Everything a run needs, checked before a single task is forked.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub tasks: TaskSpec,
    pub cgroup: Option<PathBuf>,
    pub cpu_set: CpuSetSpec,
    pub cookies: CookieMode,
    pub dir: PathBuf,
    /// `None` waits for tasks to exit on their own.
    pub duration: Option<Duration>,
    /// How long interrupted tasks get to exit before the run fails.
    pub grace: Duration,
    /// Where CPU topology is read from.
    pub sysfs: PathBuf,
}

impl RunConfig {
    pub fn new(tasks: TaskSpec) -> Self {
        Self {
            tasks,
            cgroup: None,
            cpu_set: CpuSetSpec::default(),
            cookies: CookieMode::Disabled,
            dir: PathBuf::from("."),
            duration: None,
            grace: DEFAULT_GRACE,
            sysfs: PathBuf::from(SYSFS_CPU_ROOT),
        }
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.nr_tasks()
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("At least one task is required");
        }
        if self.cookies.count() > self.nr_tasks() {
            bail!(
                "Cookie count {} exceeds the number of tasks {}",
                self.cookies.count(),
                self.nr_tasks()
            );
        }
        if !self.cpu_set.is_empty() && self.cgroup.is_none() {
            bail!("A cpu set requires a cgroup");
        }
        Ok(())
    }
}

/// Create the results directory if needed.
pub fn prepare_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create results directory {}", dir.display()))?;
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskGroup;
    use tempfile::TempDir;

    fn tasks(n: usize) -> TaskSpec {
        TaskSpec::new(vec![TaskGroup::new("true", n).unwrap()])
    }

    #[test]
    fn test_validate() {
        let mut cfg = RunConfig::new(tasks(4));
        assert!(cfg.validate().is_ok());

        cfg.cookies = CookieMode::Real(4);
        assert!(cfg.validate().is_ok());
        cfg.cookies = CookieMode::Fake(5);
        assert!(cfg.validate().is_err());
        cfg.cookies = CookieMode::Disabled;

        cfg.cpu_set = CpuSetSpec::parse("0-1").unwrap();
        assert!(cfg.validate().is_err());
        cfg.cgroup = Some(PathBuf::from("/sys/fs/cgroup/schtest"));
        assert!(cfg.validate().is_ok());

        assert!(RunConfig::new(TaskSpec::default()).validate().is_err());
    }

    #[test]
    fn test_prepare_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("a/b");
        prepare_dir(&dir).unwrap();
        assert!(dir.is_dir());
        prepare_dir(&dir).unwrap();

        let file = tmp.path().join("file");
        std::fs::write(&file, "").unwrap();
        assert!(prepare_dir(&file).is_err());
    }
}
