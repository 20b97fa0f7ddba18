//! Process spawning, signalling and reaping.
//!
//! The supervisor talks to processes through the [`Spawner`] trait so the
//! state machine can be driven in tests without forking. The real
//! implementation puts each service in its own session, drops identity
//! when a user is configured, and writes managed pid files.

use crate::error::{Error, Result};
use crate::service::Service;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{setsid, setuid, Pid, User};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, error, info, warn};

/// Default PATH exported to every child.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default SHELL exported to every child.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// A reaped child.
#[derive(Debug, Clone, Copy)]
pub struct ExitEvent {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Seam between the state machine and the kernel.
pub trait Spawner {
    /// Fork/exec a service; returns the child pid.
    fn spawn(&mut self, svc: &Service) -> Result<u32>;
    /// Deliver a signal to a previously spawned pid.
    fn kill(&mut self, pid: u32, sig: Signal) -> Result<()>;
}

/// The real spawner.
#[derive(Debug, Default)]
pub struct SystemSpawner;

impl Spawner for SystemSpawner {
    fn spawn(&mut self, svc: &Service) -> Result<u32> {
        let mut cmd = Command::new(&svc.cmd);
        cmd.args(&svc.args);
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("SHELL", DEFAULT_SHELL);

        if let Some(dir) = &svc.workdir {
            cmd.current_dir(dir);
            cmd.env("PWD", dir);
        }

        let rlimits: Vec<(Resource, u64, u64)> = svc
            .rlimits
            .iter()
            .filter_map(|rl| match parse_resource(&rl.resource) {
                Some(res) => Some((res, rl.soft, rl.hard)),
                None => {
                    warn!(service = %svc.ident(), resource = %rl.resource, "unknown rlimit resource");
                    None
                }
            })
            .collect();
        if !rlimits.is_empty() {
            unsafe {
                cmd.pre_exec(move || {
                    for (res, soft, hard) in &rlimits {
                        setrlimit(*res, *soft, *hard)
                            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    }
                    Ok(())
                });
            }
        }

        if let Some(user) = &svc.user {
            let uid = User::from_name(user)?
                .ok_or_else(|| Error::SpawnFailed(format!("no such user: {}", user)))?
                .uid;
            unsafe {
                cmd.pre_exec(move || {
                    setuid(uid).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    Ok(())
                });
            }
        }

        // Each service runs in its own session so signals to the service
        // do not leak to us or to siblings.
        unsafe {
            cmd.pre_exec(|| {
                setsid().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        if let Some(cgroup) = &svc.cgroup {
            // Placement is the cgroup collaborator's job
            debug!(service = %svc.ident(), cgroup, "cgroup placement delegated");
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let child = cmd
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", svc.cmdline(), e)))?;
        let pid = child.id();
        info!(service = %svc.ident(), pid, "spawned process");

        if let Some(pf) = &svc.pidfile {
            if pf.managed {
                if let Err(e) = std::fs::write(&pf.path, format!("{}\n", pid)) {
                    warn!(service = %svc.ident(), path = %pf.path.display(), error = %e,
                          "failed writing pid file");
                }
            }
        }

        Ok(pid)
    }

    fn kill(&mut self, pid: u32, sig: Signal) -> Result<()> {
        signal::kill(Pid::from_raw(pid as i32), sig)?;
        debug!(pid, signal = %sig, "sent signal");
        Ok(())
    }
}

/// Drain every ready child with non-blocking wait-any. Called after
/// SIGCHLD; as pid 1 this also reaps orphans nobody else will.
pub fn reap() -> Vec<ExitEvent> {
    let mut events = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code, "reaped child");
                events.push(ExitEvent {
                    pid: pid.as_raw() as u32,
                    code: Some(code),
                    signal: None,
                });
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                debug!(pid = pid.as_raw(), signal = %sig, "reaped signaled child");
                events.push(ExitEvent {
                    pid: pid.as_raw() as u32,
                    code: None,
                    signal: Some(sig as i32),
                });
            }
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(_) => continue,
            Err(e) => {
                error!(error = %e, "error reaping children");
                break;
            }
        }
    }

    events
}

/// Run a command line to completion, logging `msg` as boot progress.
/// Returns the exit code; spawn failure maps to 127 like a shell would.
pub fn run_and_wait(cmdline: &str, msg: &str) -> i32 {
    info!("{}", msg);

    let mut parts = cmdline.split_whitespace();
    let Some(prog) = parts.next() else {
        return 127;
    };

    match Command::new(prog)
        .args(parts)
        .env("PATH", DEFAULT_PATH)
        .stdin(Stdio::null())
        .status()
    {
        Ok(status) => {
            let code = status.code().unwrap_or(127);
            if code != 0 {
                warn!(command = cmdline, code, "command failed");
            }
            code
        }
        Err(e) => {
            warn!(command = cmdline, error = %e, "failed running command");
            127
        }
    }
}

/// Execute every executable in `dir`, sorted by name. Used for the
/// `runparts` boot-script directory.
pub fn run_parts(dir: &Path) -> Result<()> {
    let mut scripts: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_executable(p))
        .collect();
    scripts.sort();

    for script in scripts {
        run_and_wait(
            &script.display().to_string(),
            &format!("Running boot script {}", script.display()),
        );
    }
    Ok(())
}

/// Map a configured rlimit resource name to the kernel resource.
fn parse_resource(name: &str) -> Option<Resource> {
    match name {
        "as" => Some(Resource::RLIMIT_AS),
        "core" => Some(Resource::RLIMIT_CORE),
        "cpu" => Some(Resource::RLIMIT_CPU),
        "data" => Some(Resource::RLIMIT_DATA),
        "fsize" => Some(Resource::RLIMIT_FSIZE),
        "memlock" => Some(Resource::RLIMIT_MEMLOCK),
        "nofile" => Some(Resource::RLIMIT_NOFILE),
        "nproc" => Some(Resource::RLIMIT_NPROC),
        "stack" => Some(Resource::RLIMIT_STACK),
        _ => None,
    }
}

/// Locate `prog` in [`DEFAULT_PATH`], returning the first executable hit.
pub fn which(prog: &str) -> Option<PathBuf> {
    if prog.contains('/') {
        let p = PathBuf::from(prog);
        return is_executable(&p).then_some(p);
    }
    DEFAULT_PATH
        .split(':')
        .map(|dir| Path::new(dir).join(prog))
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
