// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use log::info;

use schtest::{run, CookieMode, CpuSetSpec, RunConfig, TaskGroup, TaskSpec};

/// schtest: core scheduling test harness.
///
/// Runs groups of tasks, optionally sharing core scheduling cookies and
/// confined to a cgroup, then writes per-task scheduler statistics and the
/// CPU sibling topology to out.txt in the results directory. The output of
/// task N goes to fork_NNN.txt next to it.
///
/// Every -t starts a task group and a following -n sets how many copies of
/// it run, e.g. `-t "stress-ng --cpu 1" -n 4 -t "sleep 10"`.
///
/// With -c N the first N tasks each get a new cookie and every other task
/// joins the cookie of task (index % N).
#[derive(Debug, Parser)]
struct Opts {
    /// Command line of a task group, split on whitespace.
    #[clap(short = 't', long = "task", action = clap::ArgAction::Append)]
    task: Vec<String>,

    /// Number of copies of the preceding task. Defaults to 1.
    #[clap(short = 'n', long = "task_count", action = clap::ArgAction::Append)]
    task_count: Vec<usize>,

    /// Cgroup to run all tasks in. Created if it doesn't exist.
    #[clap(short = 'g', long)]
    cgroup: Option<PathBuf>,

    /// CPUs to restrict the cgroup to, e.g. 0-3,8. Requires --cgroup.
    #[clap(short = 's', long = "cpu_set", requires = "cgroup")]
    cpu_set: Option<String>,

    /// Number of core scheduling cookies. Must not exceed the number of
    /// tasks. 0 disables cookies.
    #[clap(short = 'c', long, default_value = "0")]
    cookies: usize,

    /// Assign synthetic cookies without calling into the kernel.
    #[clap(short = 'f', long = "fake_cookies", action = clap::ArgAction::SetTrue)]
    fake_cookies: bool,

    /// Results directory.
    #[clap(short = 'D', long, default_value = ".")]
    dir: PathBuf,

    /// Seconds to run before interrupting tasks. 0 waits for them to exit.
    #[clap(short = 'd', long, default_value = "0")]
    duration: u64,

    /// Seconds interrupted tasks get to exit before the run fails.
    #[clap(short = 'G', long, default_value = "1.0")]
    grace: f64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Pair each -n with the -t that precedes it on the command line.
fn task_spec(opts: &Opts, matches: &ArgMatches) -> Result<TaskSpec> {
    let task_idxs: Vec<usize> = matches
        .indices_of("task")
        .map(|i| i.collect())
        .unwrap_or_default();
    let count_idxs: Vec<usize> = matches
        .indices_of("task_count")
        .map(|i| i.collect())
        .unwrap_or_default();

    let mut counts = vec![1; opts.task.len()];
    for (count_idx, count) in count_idxs.iter().zip(&opts.task_count) {
        match task_idxs.iter().rposition(|t| t < count_idx) {
            Some(task) => counts[task] = *count,
            None => bail!("-n/--task_count must follow a -t/--task"),
        }
    }

    let groups = opts
        .task
        .iter()
        .zip(counts)
        .map(|(cmd, count)| TaskGroup::new(cmd, count))
        .collect::<Result<Vec<_>>>()?;
    Ok(TaskSpec::new(groups))
}

fn build_config(opts: &Opts, matches: &ArgMatches) -> Result<RunConfig> {
    let mut cfg = RunConfig::new(task_spec(opts, matches)?);
    cfg.cgroup = opts.cgroup.clone();
    if let Some(cpu_set) = &opts.cpu_set {
        cfg.cpu_set = CpuSetSpec::parse(cpu_set)?;
    }
    cfg.cookies = CookieMode::new(opts.cookies, opts.fake_cookies);
    cfg.dir = opts.dir.clone();
    cfg.duration = match opts.duration {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    cfg.grace = Duration::try_from_secs_f64(opts.grace)
        .with_context(|| format!("Invalid grace period {}", opts.grace))?;
    cfg.validate()?;
    Ok(cfg)
}

fn config_error(msg: impl Display) -> ! {
    Opts::command()
        .error(ErrorKind::ValueValidation, msg)
        .exit()
}

fn main() -> Result<()> {
    let matches = Opts::command().get_matches();
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let cfg = build_config(&opts, &matches).unwrap_or_else(|e| config_error(format!("{:#}", e)));

    let outcome = run(&cfg)?;
    outcome.summary().log();
    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RunConfig> {
        let matches = Opts::command().try_get_matches_from(args)?;
        let opts = Opts::from_arg_matches(&matches)?;
        build_config(&opts, &matches)
    }

    fn layout(cfg: &RunConfig) -> Vec<(String, usize)> {
        cfg.tasks
            .groups()
            .iter()
            .map(|g| (g.command().to_string(), g.count()))
            .collect()
    }

    #[test]
    fn test_task_counts_follow_their_task() {
        let cfg = parse(&[
            "schtest", "-t", "true", "-n", "3", "-t", "sleep 1", "-t", "false", "-n", "2",
        ])
        .unwrap();
        assert_eq!(
            layout(&cfg),
            vec![
                ("true".to_string(), 3),
                ("sleep 1".to_string(), 1),
                ("false".to_string(), 2),
            ]
        );
        assert_eq!(cfg.nr_tasks(), 6);
        assert_eq!(cfg.duration, None);
        assert_eq!(cfg.cookies, CookieMode::Disabled);
    }

    #[test]
    fn test_last_count_wins() {
        let cfg = parse(&["schtest", "-t", "true", "-n", "3", "-n", "5"]).unwrap();
        assert_eq!(layout(&cfg), vec![("true".to_string(), 5)]);
    }

    #[test]
    fn test_options() {
        let cfg = parse(&[
            "schtest", "-t", "true", "-n", "4", "-c", "2", "-f", "-d", "5", "-G", "0.5", "-D",
            "/tmp/res", "-g", "/sys/fs/cgroup/t", "-s", "0-3",
        ])
        .unwrap();
        assert_eq!(cfg.cookies, CookieMode::Fake(2));
        assert_eq!(cfg.duration, Some(Duration::from_secs(5)));
        assert_eq!(cfg.grace, Duration::from_millis(500));
        assert_eq!(cfg.dir, PathBuf::from("/tmp/res"));
        assert_eq!(cfg.cpu_set.as_str(), "0-3");
    }

    #[test]
    fn test_config_errors() {
        assert!(parse(&["schtest"]).is_err());
        assert!(parse(&["schtest", "-n", "2", "-t", "true"]).is_err());
        assert!(parse(&["schtest", "-t", "true", "-c", "2"]).is_err());
        assert!(parse(&["schtest", "-t", "true", "-s", "0-1"]).is_err());
        assert!(parse(&["schtest", "-t", "", "-n", "1"]).is_err());
        assert!(parse(&["schtest", "-t", "true", "-G", "-1"]).is_err());
    }
}
