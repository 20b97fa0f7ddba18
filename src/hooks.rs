//! Named bootstrap hook points and the built-in bootmisc plugin.
//!
//! External collaborators (plugins) register callbacks at named points in
//! the bootstrap sequence; the driver runs them in registration order and
//! asserts a oneshot `hook/<name>` condition for every point that has
//! fired, so late-declared services can gate on boot progress.

use crate::system::SystemState;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::symlink;
use std::path::Path;
use tracing::{debug, warn};

/// A named point in the bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Before anything is up; banner printing only.
    Banner,
    /// Root filesystem checked and (re)mounted.
    RootfsUp,
    /// `mount -a` failed.
    MountError,
    /// After `mount -a`.
    MountPost,
    /// Base filesystems up, configuration parsed.
    BasefsUp,
    /// All bootstrap services have started.
    SvcUp,
    /// Very end of bootstrap.
    SystemUp,
}

impl Hook {
    pub const ALL: [Hook; 7] = [
        Hook::Banner,
        Hook::RootfsUp,
        Hook::MountError,
        Hook::MountPost,
        Hook::BasefsUp,
        Hook::SvcUp,
        Hook::SystemUp,
    ];

    /// Condition name asserted once this hook has run.
    pub fn cond_name(&self) -> &'static str {
        match self {
            Hook::Banner => "hook/banner",
            Hook::RootfsUp => "hook/rootfs-up",
            Hook::MountError => "hook/mount-error",
            Hook::MountPost => "hook/mount-post",
            Hook::BasefsUp => "hook/basefs-up",
            Hook::SvcUp => "hook/svc-up",
            Hook::SystemUp => "hook/system-up",
        }
    }
}

type HookFn = Box<dyn FnMut(&SystemState)>;

/// Registry of hook callbacks, run in registration order per point.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<Hook, Vec<(String, HookFn)>>,
    ran: HashSet<Hook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` to run at `hook`. `name` is for logging only.
    pub fn register<F>(&mut self, hook: Hook, name: &str, f: F)
    where
        F: FnMut(&SystemState) + 'static,
    {
        self.hooks
            .entry(hook)
            .or_default()
            .push((name.to_string(), Box::new(f)));
    }

    /// Run every callback registered at `hook`.
    pub fn run(&mut self, hook: Hook, st: &SystemState) {
        self.ran.insert(hook);
        if let Some(callbacks) = self.hooks.get_mut(&hook) {
            for (name, f) in callbacks {
                debug!(hook = ?hook, plugin = %name, "running hook");
                f(st);
            }
        }
    }

    /// Whether `hook` has fired at least once.
    pub fn has_run(&self, hook: Hook) -> bool {
        self.ran.contains(&hook)
    }
}

/// Register the built-in bootmisc plugin: stale-file cleanup after
/// `mount -a` and the FHS `/var` skeleton once base filesystems are up.
pub fn register_builtin(reg: &mut HookRegistry) {
    reg.register(Hook::MountPost, "bootmisc", |_st| bootclean());
    reg.register(Hook::BasefsUp, "bootmisc", |_st| var_setup());
}

/// Remove stale runtime files from previous boots. tmpfs mounts are
/// skipped, nothing survives there anyway.
fn bootclean() {
    for dir in ["/tmp", "/var/run", "/var/lock"] {
        if is_tmpfs(Path::new(dir)) {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            debug!(path = %path.display(), "removing stale boot file");
            let res = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = res {
                warn!(path = %path.display(), error = %e, "failed removing stale file");
            }
        }
    }
}

/// Create the standard FHS structure in /var and the /run compat links.
fn var_setup() {
    for (dir, mode) in [
        ("/var/cache", 0o755),
        ("/var/db", 0o755),
        ("/var/lib", 0o755),
        ("/var/lib/misc", 0o755),
        ("/var/log", 0o755),
        ("/var/mail", 0o755),
        ("/var/spool", 0o755),
        ("/var/tmp", 0o755),
        ("/var/empty", 0o755),
    ] {
        makedir(Path::new(dir), mode);
    }

    if Path::new("/run").is_dir() {
        makedir(Path::new("/run/lock"), 0o1777);
        compat_link("/run/lock", "/var/lock");
        compat_link("/dev/shm", "/run/shm");
        compat_link("/run", "/var/run");
    } else {
        makedir(Path::new("/var/lock"), 0o1777);
        makedir(Path::new("/var/run"), 0o755);
    }

    if !Path::new("/etc/mtab").exists() {
        compat_link("../proc/self/mounts", "/etc/mtab");
    }
}

fn makedir(path: &Path, mode: u32) {
    use std::os::unix::fs::DirBuilderExt;
    if path.is_dir() {
        return;
    }
    if let Err(e) = std::fs::DirBuilder::new().mode(mode).create(path) {
        warn!(path = %path.display(), error = %e, "failed creating directory");
    }
}

fn compat_link(target: &str, link: &str) {
    if Path::new(link).symlink_metadata().is_ok() {
        return;
    }
    if let Err(e) = symlink(target, link) {
        warn!(link, target, error = %e, "failed creating compat symlink");
    }
}

/// Whether `path` resolves to a tmpfs mount point per /proc/mounts.
fn is_tmpfs(path: &Path) -> bool {
    let Ok(real) = std::fs::canonicalize(path) else {
        return false;
    };
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _fsname = fields.next();
        let dir = fields.next();
        let fstype = fields.next();
        dir == Some(real.to_str().unwrap_or_default()) && fstype == Some("tmpfs")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn hooks_run_in_registration_order() {
        let mut reg = HookRegistry::new();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        let o1 = Rc::clone(&order);
        reg.register(Hook::BasefsUp, "first", move |_| o1.borrow_mut().push(1));
        let o2 = Rc::clone(&order);
        reg.register(Hook::BasefsUp, "second", move |_| o2.borrow_mut().push(2));

        let st = SystemState::default();
        reg.run(Hook::BasefsUp, &st);
        assert_eq!(*order.borrow(), vec![1, 2]);
        assert!(reg.has_run(Hook::BasefsUp));
        assert!(!reg.has_run(Hook::SvcUp));
    }

    #[test]
    fn unregistered_hook_still_marks_ran() {
        let mut reg = HookRegistry::new();
        let st = SystemState::default();
        reg.run(Hook::Banner, &st);
        assert!(reg.has_run(Hook::Banner));
    }

    #[test]
    fn hook_callbacks_observe_state() {
        let mut reg = HookRegistry::new();
        let seen = Rc::new(Cell::new(0u8));
        let s = Rc::clone(&seen);
        reg.register(Hook::SvcUp, "probe", move |st| s.set(st.cfglevel));

        let mut st = SystemState::default();
        st.cfglevel = 7;
        reg.run(Hook::SvcUp, &st);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn cond_names_are_unique() {
        let mut names: Vec<&str> = Hook::ALL.iter().map(|h| h.cond_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Hook::ALL.len());
    }
}
