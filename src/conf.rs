//! Declarative configuration: the line-oriented conf file, the include
//! directory, and the kernel command line.
//!
//! Each line is stripped of leading blanks and everything from the first
//! `#`; blank lines are skipped. Directives dispatch through a
//! `(prefix, handler)` table so adding one stays a one-line change.
//! A bad line is logged and skipped, the boot continues.

use crate::error::Result;
use crate::fs;
use crate::process::{run_and_wait, DEFAULT_PATH, DEFAULT_SHELL};
use crate::registry::Registry;
use crate::service::{Rlimit, ServiceKind};
use crate::system::{SystemState, TtyLine};
use crate::watcher::Watcher;
use nix::sys::inotify::AddWatchFlags;
use std::path::Path;
use tracing::{debug, info, warn};

/// Default baud rate for `tty` lines declared without one.
pub const DEFAULT_BAUD: u32 = 115_200;

struct ParseCtx<'a> {
    st: &'a mut SystemState,
    reg: &'a mut Registry,
}

type Handler = fn(&mut ParseCtx, &str) -> Result<()>;

/// Directive dispatch table. First match on `<prefix> ` wins.
const DIRECTIVES: &[(&str, Handler)] = &[
    ("check", h_check),
    ("user", h_user),
    ("host", h_host),
    ("module", h_module),
    ("mknod", h_mknod),
    ("network", h_network),
    ("runparts", h_runparts),
    ("startx", h_startx),
    ("shutdown", h_shutdown),
    ("rlimit", h_rlimit),
    ("runlevel", h_runlevel),
    ("service", h_service),
    ("task", h_task),
    ("run", h_run),
    ("sysv", h_sysv),
    ("console", h_console),
    ("tty", h_tty),
];

fn h_check(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    // Legacy, prefer fstab passno; runs ahead of the fstab-driven passes.
    fs::check_device(arg, &ctx.st.fstab);
    Ok(())
}

fn h_user(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.st.username = Some(arg.to_string());
    Ok(())
}

fn h_host(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.st.hostname = Some(arg.to_string());
    Ok(())
}

fn h_module(_ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    run_and_wait(
        &format!("modprobe {}", arg),
        &format!("Loading kernel module {}", arg),
    );
    Ok(())
}

fn h_mknod(_ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    run_and_wait(
        &format!("mknod {}", arg),
        &format!("Creating device node {}", arg),
    );
    Ok(())
}

fn h_network(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.st.network = Some(arg.to_string());
    Ok(())
}

fn h_runparts(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.st.runparts = Some(arg.into());
    Ok(())
}

fn h_startx(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    let user = ctx.st.username.clone();
    ctx.reg
        .register(ServiceKind::Service, arg, user.as_deref())?;
    Ok(())
}

fn h_shutdown(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.st.sdown = Some(arg.to_string());
    Ok(())
}

fn h_rlimit(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.reg.push_default_rlimit(Rlimit::parse(arg)?);
    Ok(())
}

fn h_runlevel(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.st.set_cfglevel(arg);
    Ok(())
}

fn h_service(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.reg.register(ServiceKind::Service, arg, None)?;
    Ok(())
}

fn h_task(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.reg.register(ServiceKind::Task, arg, None)?;
    Ok(())
}

fn h_run(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.reg.register(ServiceKind::Run, arg, None)?;
    Ok(())
}

fn h_sysv(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.reg.register(ServiceKind::Sysv, arg, None)?;
    Ok(())
}

fn h_console(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    ctx.st.console = Some(arg.to_string());
    Ok(())
}

fn h_tty(ctx: &mut ParseCtx, arg: &str) -> Result<()> {
    let mut parts = arg.split_whitespace();
    let Some(device) = parts.next() else {
        warn!("tty directive without a device");
        return Ok(());
    };
    let baud = parts
        .next()
        .and_then(|b| b.parse().ok())
        .unwrap_or(DEFAULT_BAUD);
    ctx.st.ttys.push(TtyLine {
        device: device.to_string(),
        baud,
    });
    Ok(())
}

/// Strip leading blanks and the `#` comment tail.
fn strip_line(line: &str) -> &str {
    let line = line.trim_start();
    match line.find('#') {
        Some(pos) => line[..pos].trim_end(),
        None => line.trim_end(),
    }
}

/// Parse one configuration file into the system state and registry.
/// A missing file is not an error, defaults apply.
pub fn parse_config(st: &mut SystemState, reg: &mut Registry, path: &Path) -> Result<()> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(());
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read configuration");
            return Ok(());
        }
    };

    debug!(path = %path.display(), "parsing configuration");
    let mut ctx = ParseCtx { st, reg };

    'line: for raw in content.lines() {
        let line = strip_line(raw);
        if line.is_empty() {
            continue;
        }

        for (prefix, handler) in DIRECTIVES {
            if let Some(arg) = line.strip_prefix(prefix) {
                if let Some(arg) = arg.strip_prefix(char::is_whitespace) {
                    if let Err(e) = handler(&mut ctx, arg.trim()) {
                        warn!(path = %path.display(), line, error = %e, "bad configuration line");
                    }
                    continue 'line;
                }
            }
        }

        warn!(path = %path.display(), line, "unknown directive, ignoring");
    }

    Ok(())
}

/// Parse the static conf file, then every `*.conf` in the include
/// directory in sorted order.
pub fn parse_all(st: &mut SystemState, reg: &mut Registry) -> Result<()> {
    let conf_file = st.conf_file.clone();
    parse_config(st, reg, &conf_file)?;

    let conf_dir = st.conf_dir.clone();
    if let Ok(dir) = std::fs::read_dir(&conf_dir) {
        let mut fragments: Vec<_> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conf"))
            .collect();
        fragments.sort();
        for fragment in fragments {
            parse_config(st, reg, &fragment)?;
        }
    }

    Ok(())
}

/// Re-parse configuration and diff against the registry: new records
/// register, changed ones update in place, vanished-and-terminal ones
/// are dropped. Returns the removed identities.
pub fn reload(st: &mut SystemState, reg: &mut Registry) -> Result<Vec<String>> {
    info!("reloading configuration");
    reg.begin_reload();
    parse_all(st, reg)?;
    Ok(reg.finish_reload())
}

/// Parse kernel command-line tokens: `debug`, `rescue`, `single`,
/// `primus.debug`, `console=...`, and a bare digit selecting the
/// runlevel to enter after bootstrap.
pub fn parse_cmdline(st: &mut SystemState, cmdline: &str) {
    for token in cmdline.split_whitespace() {
        match token {
            "debug" | "primus.debug" => st.debug = true,
            "rescue" => st.rescue = true,
            "single" => st.single = true,
            _ => {
                if let Some(console) = token.strip_prefix("console=") {
                    st.console = Some(console.to_string());
                } else if token.len() == 1 {
                    if let Some(level) = token.chars().next().and_then(|c| c.to_digit(10)) {
                        st.cmdlevel = Some(level as u8);
                    }
                }
            }
        }
    }
}

/// Read `/proc/cmdline`, empty when unavailable.
pub fn read_kernel_cmdline() -> String {
    std::fs::read_to_string("/proc/cmdline").unwrap_or_default()
}

/// Export a sane base environment before spawning anything.
pub fn reset_env() {
    std::env::set_var("PATH", DEFAULT_PATH);
    std::env::set_var("SHELL", DEFAULT_SHELL);
    std::env::set_var("PWD", "/");
}

/// Install inotify monitors for the configuration file, the include
/// directory, and their parents. Idempotent; missing paths are retried
/// on later calls via parent-directory events.
pub fn monitor(st: &SystemState, watcher: &mut Watcher) -> Result<()> {
    watcher.add(&st.conf_file, AddWatchFlags::empty())?;
    watcher.add(&st.conf_dir, AddWatchFlags::empty())?;
    if let Some(parent) = st.conf_file.parent() {
        watcher.add(parent, AddWatchFlags::empty())?;
    }
    Ok(())
}
