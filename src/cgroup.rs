// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cgroup placement for a run's tasks.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::unistd::Pid;

use crate::topology::CpuSetSpec;

const CPUSET_CPUS: &str = "cpuset.cpus";
const CGROUP_PROCS: &str = "cgroup.procs";

#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    created: bool,
}

impl Cgroup {
    /// Open `path`, creating the cgroup if it doesn't exist yet. A cgroup
    /// created here is removed again on drop.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.is_dir() {
            return Ok(Self {
                path,
                created: false,
            });
        }

        std::fs::create_dir(&path)
            .with_context(|| format!("Failed to create cgroup {}", path.display()))?;
        info!("Created cgroup {}", path.display());
        Ok(Self {
            path,
            created: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, file: &str, val: &str) -> Result<()> {
        let path = self.path.join(file);
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        f.write_all(val.as_bytes())
            .with_context(|| format!("Failed to write {:?} to {}", val, path.display()))?;
        Ok(())
    }

    /// Restrict the cgroup to `cpu_set`. Without a cpuset controller this
    /// only fails if CPUs were actually requested.
    pub fn set_cpus(&self, cpu_set: &CpuSetSpec) -> Result<()> {
        let path = self.path.join(CPUSET_CPUS);
        if !path.exists() {
            if cpu_set.is_empty() {
                debug!("No {} in {}, leaving cpus alone", CPUSET_CPUS, self.path.display());
                return Ok(());
            }
            bail!(
                "Cannot set cpus {} on {}: {}",
                cpu_set,
                self.path.display(),
                std::io::Error::from(std::io::ErrorKind::PermissionDenied)
            );
        }

        self.append(CPUSET_CPUS, cpu_set.as_str())
    }

    /// Move every pid into the cgroup, one write per pid.
    pub fn add_procs(&self, pids: &[Pid]) -> Result<()> {
        for pid in pids {
            self.append(CGROUP_PROCS, &pid.to_string())
                .with_context(|| format!("Failed to move pid {} to cgroup", pid))?;
        }
        Ok(())
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        if !self.created {
            return;
        }
        match std::fs::remove_dir(&self.path) {
            Ok(()) => debug!("Removed cgroup {}", self.path.display()),
            Err(e) => warn!("Failed to remove cgroup {}: {}", self.path.display(), e),
        }
    }
}
