// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Forking tasks
//!
//! Every task is forked from the parent and execs its command with stdout
//! and stderr redirected to `fork_<index>.txt` in the results directory.
//! Between fork and exec a child may join a donor's cookie; nothing in that
//! window allocates, everything it touches is prepared before the fork.
//!
//! Tasks are owned by a [`TaskSet`]. Dropping it kills and reaps whatever
//! is still running, so every error return after the first fork leaves no
//! task behind.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::RunConfig;
use crate::cookie::{copy_cookie, create_cookie, CookieBarrier, CookieMode};
use crate::task::{output_path, TaskGroup, TaskInfo};

/// Child exit status when joining the donor's cookie failed.
pub const EXIT_COOKIE: i32 = 3;
/// Child exit status when the output file couldn't be set up.
pub const EXIT_REDIRECT: i32 = 4;
/// Child exit status when the original signal mask couldn't be restored.
pub const EXIT_SIGMASK: i32 = 5;
/// Child exit status when the command couldn't be executed.
pub const EXIT_EXEC: i32 = 127;

/// Forked tasks in index order.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<TaskInfo>,
}

impl TaskSet {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskInfo] {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut [TaskInfo] {
        &mut self.tasks
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.iter().map(|t| t.pid).collect()
    }

    pub fn find(&self, pid: Pid) -> Option<&TaskInfo> {
        self.tasks.iter().find(|t| t.pid == pid)
    }

    pub fn nr_running(&self) -> usize {
        self.tasks.iter().filter(|t| t.running).count()
    }

    /// Hand over the finished tasks. Nothing is left for drop to kill.
    pub fn into_tasks(mut self) -> Vec<TaskInfo> {
        std::mem::take(&mut self.tasks)
    }

    /// SIGKILL and reap every task that is still running.
    pub fn kill_all(&mut self) {
        for task in self.tasks.iter_mut().filter(|t| t.running) {
            match kill(task.pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill task {} pid {}: {}", task.index, task.pid, e),
            }
            if let Err(e) = waitpid(task.pid, None) {
                warn!("Failed to reap task {} pid {}: {}", task.index, task.pid, e);
            }
            task.running = false;
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        let nr_running = self.nr_running();
        if nr_running > 0 {
            warn!("Killing {} remaining tasks", nr_running);
            self.kill_all();
        }
    }
}

/// What a child does about its cookie before exec.
#[derive(Debug, Clone, Copy)]
enum ChildCookie {
    None,
    Fake,
    CopyFrom(Pid),
}

/// Everything a child needs to exec its command, prepared before fork.
/// The failure messages carry the task index, command and paths so the
/// child only has to append the errno.
struct ExecArgs {
    argv: Vec<CString>,
    out: CString,
    cookie: ChildCookie,
    cookie_msg: Vec<u8>,
    open_msg: Vec<u8>,
    redirect_msg: Vec<u8>,
    sigmask_msg: Vec<u8>,
    exec_msg: Vec<u8>,
}

impl ExecArgs {
    fn new(index: usize, group: &TaskGroup, out: &Path, cookie: ChildCookie) -> Result<Self> {
        let argv = group
            .args()
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Task command {:?} contains a nul byte", group.command()))?;
        if argv.is_empty() {
            bail!("Empty task command");
        }
        let out_c = CString::new(out.as_os_str().as_bytes())
            .with_context(|| format!("Output path {} contains a nul byte", out.display()))?;

        let msg = |what: String| format!("schtest: task {}: {}", index, what).into_bytes();
        let donor = match cookie {
            ChildCookie::CopyFrom(pid) => format!("pid {}", pid),
            _ => "none".to_string(),
        };
        Ok(Self {
            argv,
            out: out_c,
            cookie,
            cookie_msg: msg(format!("failed to copy cookie from donor {}", donor)),
            open_msg: msg(format!("failed to open {}", out.display())),
            redirect_msg: msg(format!("failed to redirect output to {}", out.display())),
            sigmask_msg: msg("failed to restore signal mask".to_string()),
            exec_msg: msg(format!("failed to exec {:?}", group.command())),
        })
    }
}

fn write_stderr(buf: &[u8]) {
    unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), buf.len()) };
}

/// Write `<msg>: errno <n> (<desc>)` and exit. Formats on the stack only.
fn child_fail(msg: &[u8], errno: Errno, code: i32) -> ! {
    let mut digits = [0u8; 12];
    let mut n = (errno as i32).unsigned_abs();
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }

    write_stderr(msg);
    write_stderr(b": errno ");
    write_stderr(&digits[i..]);
    write_stderr(b" (");
    write_stderr(errno.desc().as_bytes());
    write_stderr(b")\n");
    unsafe { libc::_exit(code) }
}

/// Runs in the forked child. Only async-signal-safe calls from here on.
fn exec_child(
    exec: &ExecArgs,
    argv: &[*const libc::c_char],
    barrier: Option<&CookieBarrier>,
    sigmask: &SigSet,
) -> ! {
    match (exec.cookie, barrier) {
        (ChildCookie::None, _) => {}
        (ChildCookie::Fake, Some(barrier)) => barrier.arrive(),
        (ChildCookie::CopyFrom(donor), Some(barrier)) => {
            if let Err(e) = copy_cookie(donor, barrier) {
                child_fail(&exec.cookie_msg, e, EXIT_COOKIE);
            }
        }
        (_, None) => child_fail(&exec.cookie_msg, Errno::EINVAL, EXIT_COOKIE),
    }

    unsafe {
        let fd = libc::open(
            exec.out.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o600 as libc::c_uint,
        );
        if fd < 0 {
            child_fail(&exec.open_msg, Errno::last(), EXIT_REDIRECT);
        }
        if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0 {
            child_fail(&exec.redirect_msg, Errno::last(), EXIT_REDIRECT);
        }
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }

    if let Err(e) = sigmask.thread_set_mask() {
        child_fail(&exec.sigmask_msg, e, EXIT_SIGMASK);
    }

    unsafe { libc::execvp(argv[0], argv.as_ptr()) };
    child_fail(&exec.exec_msg, Errno::last(), EXIT_EXEC);
}

/// Fork and exec every task of `cfg`, setting up cookies on the way.
///
/// `barrier` must be present when cookies are enabled. `sigmask` is the
/// signal mask children restore before exec.
pub fn spawn_tasks(
    cfg: &RunConfig,
    barrier: Option<&CookieBarrier>,
    sigmask: &SigSet,
) -> Result<TaskSet> {
    let mode = cfg.cookies;
    if mode.is_enabled() && barrier.is_none() {
        bail!("Cookies requested without a cookie barrier");
    }

    let mut set = TaskSet::default();
    info!("Forking {} tasks", cfg.nr_tasks());

    for (index, group) in cfg.tasks.tasks().enumerate() {
        let donor = mode.donor_of(index);
        let cookie = match mode {
            CookieMode::Disabled => ChildCookie::None,
            CookieMode::Fake(_) => ChildCookie::Fake,
            CookieMode::Real(_) if mode.is_donor(index) => ChildCookie::None,
            CookieMode::Real(_) => match donor {
                Some(donor) => ChildCookie::CopyFrom(set.tasks[donor].pid),
                None => bail!("No cookie donor for task {}", index),
            },
        };

        let exec = ExecArgs::new(index, group, &output_path(&cfg.dir, index), cookie)
            .with_context(|| format!("Failed to prepare task {}", index))?;
        let mut argv: Vec<*const libc::c_char> = exec.argv.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        let pid = match unsafe { fork() } {
            Ok(ForkResult::Child) => exec_child(&exec, &argv, barrier, sigmask),
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to fork task {}", index));
            }
        };
        debug!("Forked task {} with pid {}", index, pid);
        set.tasks.push(TaskInfo::new(index, pid));

        let cookie = match (mode, barrier, donor) {
            (CookieMode::Fake(_), _, _) => mode.fake_cookie(index),
            (CookieMode::Real(_), Some(barrier), _) if mode.is_donor(index) => {
                create_cookie(index, pid, barrier)?
            }
            (CookieMode::Real(_), _, Some(donor)) => set.tasks[donor].cookie,
            _ => 0,
        };
        set.tasks[index].cookie = cookie;
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_args() {
        let group = TaskGroup::new("sleep  10", 1).unwrap();
        let donor = ChildCookie::CopyFrom(Pid::from_raw(42));
        let exec = ExecArgs::new(3, &group, Path::new("/tmp/fork_003.txt"), donor).unwrap();
        assert_eq!(
            exec.argv,
            vec![CString::new("sleep").unwrap(), CString::new("10").unwrap()]
        );
        assert_eq!(exec.out, CString::new("/tmp/fork_003.txt").unwrap());
        assert_eq!(
            exec.cookie_msg,
            b"schtest: task 3: failed to copy cookie from donor pid 42".to_vec()
        );
        assert_eq!(
            exec.open_msg,
            b"schtest: task 3: failed to open /tmp/fork_003.txt".to_vec()
        );
        assert_eq!(
            exec.sigmask_msg,
            b"schtest: task 3: failed to restore signal mask".to_vec()
        );
        assert_eq!(
            exec.exec_msg,
            b"schtest: task 3: failed to exec \"sleep  10\"".to_vec()
        );
    }

    #[test]
    fn test_task_set_lookup() {
        let mut set = TaskSet::default();
        assert!(set.is_empty());
        set.tasks.push(TaskInfo::new(0, Pid::from_raw(1000)));
        set.tasks.push(TaskInfo::new(1, Pid::from_raw(1001)));
        set.tasks[0].running = false;

        assert_eq!(set.len(), 2);
        assert_eq!(set.nr_running(), 1);
        assert_eq!(set.find(Pid::from_raw(1001)).map(|t| t.index), Some(1));
        assert!(set.find(Pid::from_raw(5)).is_none());
        assert_eq!(set.pids(), vec![Pid::from_raw(1000), Pid::from_raw(1001)]);

        set.tasks[1].running = false;
        assert_eq!(set.into_tasks().len(), 2);
    }
}
