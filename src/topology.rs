// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Hyperthread sibling discovery
//!
//! Resolves a requested CPU set into groups of CPUs that share a physical
//! core. Each named CPU's `topology/thread_siblings_list` is read from sysfs
//! and merged into the group of any sibling already seen, so every CPU ends
//! up in exactly one group. An empty CPU set stands for every online CPU.
//!
//! Groups are kept in discovery order, which is the order the results file
//! lists them in.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sscanf::sscanf;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Largest NR_CPUS the kernel can be configured with.
pub const MAX_CPUS: usize = 8192;

/// Parse a kernel style cpulist such as `0-3,8,10-11`.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let group = group.trim();
        let (min, max) = match sscanf!(group, "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group, "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist element {:?} in {:?}", group, cpulist);
                }
            },
        };
        if min > max {
            bail!("Descending range {}-{} in cpulist {:?}", min, max, cpulist);
        }
        if max >= MAX_CPUS {
            bail!("CPU {} in cpulist {:?} is out of range", max, cpulist);
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

/// A CPU set as given on the command line. The original string is kept
/// because it is written verbatim to `cpuset.cpus` and the results file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSetSpec {
    spec: String,
    cpus: Vec<usize>,
}

impl CpuSetSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Self::default());
        }
        let cpus = read_cpulist(spec).with_context(|| format!("Invalid cpu set {:?}", spec))?;
        Ok(Self {
            spec: spec.to_string(),
            cpus,
        })
    }

    /// True when no CPUs were named, meaning all online CPUs.
    pub fn is_empty(&self) -> bool {
        self.spec.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }
}

impl fmt::Display for CpuSetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "empty")
        } else {
            write!(f, "{}", self.spec)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopology {
    groups: Vec<BTreeSet<usize>>,
}

impl CpuTopology {
    pub fn discover_with_path(cpu_set: &CpuSetSpec, sysfs: &Path) -> Result<Self> {
        let cpus = if cpu_set.is_empty() {
            let online = sysfs.join("online");
            let list = std::fs::read_to_string(&online)
                .with_context(|| format!("Failed to read {}", online.display()))?;
            read_cpulist(&list).with_context(|| format!("Failed to parse {}", online.display()))?
        } else {
            cpu_set.cpus().to_vec()
        };

        let mut topo = Self::default();
        for cpu in cpus {
            if topo.contains(cpu) {
                continue;
            }
            let path = siblings_path(sysfs, cpu);
            let list = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to open siblings of cpu {}", cpu))?;
            let siblings = read_cpulist(&list)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            topo.insert(cpu, siblings);
        }

        Ok(topo)
    }

    fn insert(&mut self, cpu: usize, siblings: Vec<usize>) {
        let pos = self
            .groups
            .iter()
            .position(|g| siblings.iter().any(|s| g.contains(s)));
        match pos {
            Some(i) => {
                self.groups[i].insert(cpu);
                self.groups[i].extend(siblings);
            }
            None => {
                let mut group: BTreeSet<usize> = siblings.into_iter().collect();
                group.insert(cpu);
                self.groups.push(group);
            }
        }
    }

    pub fn from_groups(groups: Vec<BTreeSet<usize>>) -> Self {
        Self { groups }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.groups.iter().any(|g| g.contains(&cpu))
    }

    pub fn groups(&self) -> &[BTreeSet<usize>] {
        &self.groups
    }

    pub fn nr_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn nr_cpus(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }
}

fn siblings_path(sysfs: &Path, cpu: usize) -> PathBuf {
    sysfs.join(format!("cpu{}/topology/thread_siblings_list", cpu))
}
