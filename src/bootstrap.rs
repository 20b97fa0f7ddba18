//! The bootstrap driver and steady-state main loop.
//!
//! Sequences filesystem bring-up, configuration, hooks and the first
//! cranks of the state machine, then waits for every bootstrap task to
//! finish (or the 120 s deadline), changes to the configured runlevel
//! and settles into the event loop: signals first, then fd readiness,
//! then expired work items.

use crate::cond::CondStore;
use crate::conf;
use crate::control::{Command, ControlServer, Reply, SvcStatus};
use crate::error::Result;
use crate::fs;
use crate::hooks::{self, Hook, HookRegistry};
use crate::process::{self, run_and_wait, which, Spawner, SystemSpawner};
use crate::reactor::{Work, WorkQueue};
use crate::registry::Registry;
use crate::service::{ServiceKind, ServiceState};
use crate::supervise::{Revival, StepFilter, Supervisor};
use crate::system::{Runlevel, SystemState, LIBEXEC_DIR, RC_LOCAL};
use crate::watcher::Watcher;
use chrono::Utc;
use std::os::fd::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Bootstrap progress is polled every 100 ms ...
const BOOTSTRAP_TICK: Duration = Duration::from_millis(100);
/// ... up to 1200 times, a hard two minute deadline.
const BOOTSTRAP_TICKS: u32 = 1200;

/// How the machine goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Poweroff,
    Reboot,
    Halt,
}

enum LoopEvent {
    Child,
    Reload,
    Shutdown(ShutdownKind),
    Control(UnixStream),
    ConfChanged,
    Work(Work),
}

/// The init process: owns every component and drives them from one
/// single-threaded loop.
pub struct Init {
    st: SystemState,
    reg: Registry,
    conds: CondStore,
    hooks: HookRegistry,
    watcher: Watcher,
    wq: WorkQueue,
    spawner: Box<dyn Spawner>,
    sup: Supervisor,
    control: ControlServer,
    ticks: u32,
    shutdown: Option<ShutdownKind>,
}

impl Init {
    pub fn new(st: SystemState) -> Self {
        Self::with_spawner(st, Box::new(SystemSpawner))
    }

    /// Construct with a custom spawner; the tests drive the state
    /// machine without forking.
    pub fn with_spawner(st: SystemState, spawner: Box<dyn Spawner>) -> Self {
        Self {
            st,
            reg: Registry::new(),
            conds: CondStore::new(),
            hooks: HookRegistry::new(),
            watcher: Watcher::new(),
            wq: WorkQueue::new(),
            spawner,
            sup: Supervisor::default(),
            control: ControlServer::with_default_path(),
            ticks: BOOTSTRAP_TICKS,
            shutdown: None,
        }
    }

    pub fn state(&self) -> &SystemState {
        &self.st
    }

    pub fn registry(&self) -> &Registry {
        &self.reg
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.reg
    }

    pub fn conditions_mut(&mut self) -> &mut CondStore {
        &mut self.conds
    }

    /// A shutdown latched by a signal or control command, taken by the
    /// loop at the end of the current iteration.
    pub fn pending_shutdown(&self) -> Option<ShutdownKind> {
        self.shutdown
    }

    /// Run bootstrap, then the main loop, until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        fs::early_mounts();

        conf::parse_cmdline(&mut self.st, &conf::read_kernel_cmdline());
        if self.st.single && self.st.cmdlevel.is_none() {
            self.st.cmdlevel = Some(1);
        }

        // Nothing is up yet; anyone hooked here is on their own.
        self.hooks.run(Hook::Banner, &self.st);
        info!("entering runlevel S");

        if self.st.rescue {
            warn!("rescue mode requested, starting emergency shell");
            fs::sulogin(false);
        }

        hooks::register_builtin(&mut self.hooks);

        conf::reset_env();
        nix::unistd::chdir("/")?;

        fs::mount_all(&mut self.st, &mut self.hooks, &mut fs::SystemFsck);

        // The condition system comes up after the early hooks; emit
        // their conditions retroactively so nothing misses them.
        for hook in Hook::ALL {
            if self.hooks.has_run(hook) {
                self.conds.set_oneshot(hook.cond_name());
            }
        }

        conf::parse_all(&mut self.st, &mut self.reg)?;

        if let Some(hostname) = self.st.hostname.clone() {
            if let Err(e) = nix::unistd::sethostname(&hostname) {
                warn!(hostname = %hostname, error = %e, "failed setting hostname");
            }
        }

        self.register_helpers();

        self.hooks.run(Hook::BasefsUp, &self.st);
        self.conds.set_oneshot(Hook::BasefsUp.cond_name());

        if let Err(e) = self.control.start() {
            error!(error = %e, "cannot start control socket, telinit will not work");
        }
        self.watcher.init()?;

        debug!("starting the big state machine");
        self.wq.schedule(Work::Crank, Duration::from_millis(10));
        self.wq.schedule(Work::Bootstrap, BOOTSTRAP_TICK);

        self.event_loop().await
    }

    /// Register bundled helper daemons when their binaries exist.
    fn register_helpers(&mut self) {
        if which(&format!("{}/watchdogd", LIBEXEC_DIR)).is_some() {
            let spec = format!(
                "[123456789] cgroup.init name:watchdog {}/watchdogd -- watchdog daemon",
                LIBEXEC_DIR
            );
            if let Err(e) = self.reg.register(ServiceKind::Service, &spec, None) {
                warn!(error = %e, "failed registering watchdog");
            }
        }
        if which(&format!("{}/keventd", LIBEXEC_DIR)).is_some() {
            let spec = format!(
                "[123456789] cgroup.init {}/keventd -- kernel event daemon",
                LIBEXEC_DIR
            );
            if let Err(e) = self.reg.register(ServiceKind::Service, &spec, None) {
                warn!(error = %e, "failed registering keventd");
            }
        }
    }

    /// The reactor. Signal work is drained ahead of fd callbacks, and
    /// timers fire after fd work, so within one iteration ordering is
    /// signals, then fds, then expired work items.
    async fn event_loop(&mut self) -> Result<()> {
        let mut sigchld = signal(SignalKind::child())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        let conf_fd: AsyncFd<RawFd> = AsyncFd::new(self.watcher.as_raw_fd()?)?;

        info!("entering main loop");
        loop {
            let event = tokio::select! {
                biased;
                _ = sigchld.recv() => LoopEvent::Child,
                _ = sighup.recv() => LoopEvent::Reload,
                _ = sigusr1.recv() => LoopEvent::Shutdown(ShutdownKind::Halt),
                _ = sigusr2.recv() => LoopEvent::Shutdown(ShutdownKind::Poweroff),
                _ = sigterm.recv() => LoopEvent::Shutdown(ShutdownKind::Reboot),
                _ = sigint.recv() => LoopEvent::Shutdown(ShutdownKind::Reboot),
                stream = self.control.accept() => match stream {
                    Ok(stream) => LoopEvent::Control(stream),
                    Err(e) => {
                        warn!(error = %e, "control accept failed");
                        continue;
                    }
                },
                ready = conf_fd.readable() => match ready {
                    Ok(mut guard) => {
                        guard.clear_ready();
                        LoopEvent::ConfChanged
                    }
                    Err(e) => {
                        warn!(error = %e, "inotify poll failed");
                        continue;
                    }
                },
                work = self.wq.next() => LoopEvent::Work(work),
            };

            match event {
                LoopEvent::Child => self.handle_sigchld(),
                LoopEvent::Reload => {
                    info!("SIGHUP, scheduling configuration reload");
                    self.wq.schedule(Work::Reload, Duration::from_millis(10));
                }
                LoopEvent::Shutdown(kind) => self.shutdown = Some(kind),
                LoopEvent::Control(mut stream) => self.handle_control(&mut stream).await,
                LoopEvent::ConfChanged => {
                    match self.watcher.drain() {
                        Ok(events) if !events.is_empty() => {
                            debug!(count = events.len(), "configuration change events");
                            self.wq.schedule(Work::Reload, Duration::from_millis(100));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "inotify drain failed"),
                    }
                }
                LoopEvent::Work(work) => self.dispatch(work),
            }

            if let Some(kind) = self.shutdown.take() {
                self.do_shutdown(kind);
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, work: Work) {
        debug!(?work, "work item fired");
        match work {
            Work::Crank => self.crank_services(StepFilter::Any),
            Work::Bootstrap => self.bootstrap_tick(),
            Work::Finalize => self.finalize(),
            Work::Supervise => self.crank_services(StepFilter::Any),
            Work::Reload => self.do_reload(),
        }
    }

    /// One supervision pass: revive condition-gated crashes, step every
    /// record, retire oneshot conditions, arm the next timed step.
    fn crank_services(&mut self, filter: StepFilter) {
        let changed = self.conds.peek_changed();
        if !changed.is_empty() {
            self.sup
                .revive_crashed(&mut self.reg, Revival::ConditionChange, &changed);
        }
        self.sup
            .step_all(&mut self.reg, &self.st, &self.conds, self.spawner.as_mut(), filter);
        self.conds.drain_changed();

        if let Some(deadline) = self.sup.next_deadline(&self.reg) {
            self.wq
                .reschedule(Work::Supervise, deadline.max(Duration::from_millis(10)));
        }
    }

    /// The 100 ms bootstrap progress poll.
    fn bootstrap_tick(&mut self) {
        if let Err(e) = conf::monitor(&self.st, &mut self.watcher) {
            debug!(error = %e, "config monitor");
        }

        self.crank_services(StepFilter::Any);

        self.ticks = self.ticks.saturating_sub(1);
        if !self.sup.service_completed(&self.reg) && self.ticks > 0 {
            debug!(ticks = self.ticks, "bootstrap tasks still running");
            self.wq.schedule(Work::Bootstrap, BOOTSTRAP_TICK);
            return;
        }

        if self.ticks > 0 {
            debug!("all bootstrap run/tasks completed, resuming bootstrap");
        } else {
            warn!("bootstrap timeout, resuming anyway");
        }

        self.wq.schedule(Work::Finalize, Duration::from_millis(10));

        if let Some(network) = self.st.network.clone() {
            if !self.st.rescue {
                run_and_wait(&network, "Bringing up networking");
            }
        }

        if let Some(runparts) = self.st.runparts.clone() {
            if runparts.is_dir() && !self.st.rescue {
                if let Err(e) = process::run_parts(&runparts) {
                    warn!(dir = %runparts.display(), error = %e, "runparts failed");
                }
            }
        }

        let level = self.st.target_level();
        self.change_runlevel(level);
    }

    /// Final stage of bootstrap.
    fn finalize(&mut self) {
        debug!("cleaning up bootstrap-only tasks that never ran");
        self.reg.prune_bootstrap();

        self.hooks.run(Hook::SvcUp, &self.st);
        self.conds.set_oneshot(Hook::SvcUp.cond_name());
        self.crank_services(StepFilter::Any);

        if !self.st.rescue && is_executable(Path::new(RC_LOCAL)) {
            run_and_wait(RC_LOCAL, &format!("Calling {}", RC_LOCAL));
        }

        self.hooks.run(Hook::SystemUp, &self.st);
        self.conds.set_oneshot(Hook::SystemUp.cond_name());
        self.crank_services(StepFilter::Any);

        // System bootstrapped; TTYs and other respawn services may start.
        self.st.bootstrap = false;
        self.crank_services(StepFilter::Respawn);

        if !self.st.ttys.is_empty() {
            info!(lines = self.st.ttys.len(), "handing TTY lines to the TTY collaborator");
        }
        info!(runlevel = %self.st.runlevel, "bootstrap complete");
    }

    /// Change to a numbered runlevel. 0 and 6 go through the shutdown
    /// path instead.
    pub fn change_runlevel(&mut self, level: u8) {
        match level {
            0 => {
                self.shutdown = Some(ShutdownKind::Poweroff);
                return;
            }
            6 => {
                self.shutdown = Some(ShutdownKind::Reboot);
                return;
            }
            1..=9 => {}
            _ => {
                warn!(level, "refusing invalid runlevel");
                return;
            }
        }

        let new = Runlevel::Numbered(level);
        if self.st.runlevel == new {
            return;
        }
        info!(from = %self.st.runlevel, to = %new, "changing runlevel");
        self.st.prevlevel = Some(self.st.runlevel);
        self.st.runlevel = new;

        self.sup.revive_crashed(&mut self.reg, Revival::RunlevelChange, &[]);
        self.crank_services(StepFilter::Any);
    }

    /// Reap everything that is ready and transition the owning records.
    fn handle_sigchld(&mut self) {
        let events = process::reap();
        if events.is_empty() {
            return;
        }
        for ev in events {
            match self.reg.mark_exited(ev.pid, ev.code, ev.signal) {
                Some(ident) => {
                    if let Some(svc) = self.reg.get_mut(&ident) {
                        self.sup.handle_exit(svc, &self.st);
                    }
                }
                None => debug!(pid = ev.pid, "reaped orphan"),
            }
        }
        self.crank_services(StepFilter::Any);
    }

    fn do_reload(&mut self) {
        match conf::reload(&mut self.st, &mut self.reg) {
            Ok(removed) => {
                if !removed.is_empty() {
                    debug!(?removed, "services dropped by reload");
                }
                self.sup.revive_crashed(&mut self.reg, Revival::Reload, &[]);
                self.crank_services(StepFilter::Any);
            }
            Err(e) => error!(error = %e, "reload failed"),
        }
    }

    async fn handle_control(&mut self, stream: &mut UnixStream) {
        let command = match ControlServer::read_command(stream).await {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "bad control command");
                return;
            }
        };
        let reply = self.execute(command);
        if let Err(e) = ControlServer::write_reply(stream, &reply).await {
            warn!(error = %e, "failed writing control reply");
        }
    }

    /// Execute one control command.
    pub fn execute(&mut self, command: Command) -> Reply {
        match command {
            Command::Runlevel { level } => match level {
                0 => {
                    self.shutdown = Some(ShutdownKind::Poweroff);
                    Reply::Ok { message: "powering off".into() }
                }
                6 => {
                    self.shutdown = Some(ShutdownKind::Reboot);
                    Reply::Ok { message: "rebooting".into() }
                }
                1..=9 => {
                    self.change_runlevel(level);
                    Reply::Ok { message: format!("runlevel {}", level) }
                }
                _ => Reply::Err { message: format!("invalid runlevel {}", level) },
            },
            Command::Reload => {
                self.do_reload();
                Reply::Ok { message: "reloaded".into() }
            }
            Command::Status => Reply::Status { services: self.status() },
            Command::Start { name } => match self.reg.find_mut(&name, None) {
                Some(svc) => {
                    svc.stop_requested = false;
                    if svc.state == ServiceState::Crashed {
                        svc.state = ServiceState::Halted;
                        svc.budget.reset();
                    }
                    self.crank_services(StepFilter::Any);
                    Reply::Ok { message: format!("starting {}", name) }
                }
                None => Reply::Err { message: format!("service not found: {}", name) },
            },
            Command::Stop { name } => match self.reg.find_mut(&name, None) {
                Some(svc) => {
                    svc.stop_requested = true;
                    self.crank_services(StepFilter::Any);
                    Reply::Ok { message: format!("stopping {}", name) }
                }
                None => Reply::Err { message: format!("service not found: {}", name) },
            },
            Command::Restart { name } => match self.reg.find_mut(&name, None) {
                Some(svc) => {
                    svc.stop_requested = false;
                    svc.restart_pending = svc.has_pid();
                    if svc.state == ServiceState::Crashed {
                        svc.state = ServiceState::Halted;
                        svc.budget.reset();
                    }
                    self.crank_services(StepFilter::Any);
                    Reply::Ok { message: format!("restarting {}", name) }
                }
                None => Reply::Err { message: format!("service not found: {}", name) },
            },
            Command::Poweroff => {
                self.shutdown = Some(ShutdownKind::Poweroff);
                Reply::Ok { message: "powering off".into() }
            }
            Command::Reboot => {
                self.shutdown = Some(ShutdownKind::Reboot);
                Reply::Ok { message: "rebooting".into() }
            }
            Command::Halt => {
                self.shutdown = Some(ShutdownKind::Halt);
                Reply::Ok { message: "halting".into() }
            }
        }
    }

    fn status(&self) -> Vec<SvcStatus> {
        self.reg
            .iter()
            .map(|svc| SvcStatus {
                ident: svc.ident(),
                kind: svc.kind.to_string(),
                state: svc.state.to_string(),
                pid: svc.pid,
                uptime_secs: svc.started_at.and_then(|t| {
                    let secs = Utc::now().signed_duration_since(t).num_seconds();
                    (svc.has_pid() && secs >= 0).then_some(secs as u64)
                }),
                restarts: svc.budget.attempts(),
                description: svc.description.clone(),
            })
            .collect()
    }

    /// Stop everything, run the shutdown script, sync, and hand the
    /// machine to the kernel. Never returns as pid 1.
    fn do_shutdown(&mut self, kind: ShutdownKind) {
        info!(?kind, "shutting down");

        for svc in self.reg.iter_mut() {
            svc.stop_requested = true;
        }
        self.sup
            .step_all(&mut self.reg, &self.st, &self.conds, self.spawner.as_mut(), StepFilter::Any);

        // Synchronous grace wait; the loop is done at this point.
        let deadline = Instant::now() + crate::service::STOP_GRACE;
        while self.reg.iter().any(|s| s.has_pid()) && Instant::now() < deadline {
            for ev in process::reap() {
                self.reg.mark_exited(ev.pid, ev.code, ev.signal);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        for svc in self.reg.iter() {
            if let Some(pid) = svc.pid {
                warn!(service = %svc.ident(), pid, "still alive at shutdown, sending SIGKILL");
                let _ = self
                    .spawner
                    .kill(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        for ev in process::reap() {
            self.reg.mark_exited(ev.pid, ev.code, ev.signal);
        }

        if let Some(sdown) = self.st.sdown.clone() {
            run_and_wait(&sdown, "Running shutdown script");
        }

        unsafe { libc::sync() };

        if std::process::id() == 1 {
            use nix::sys::reboot::{reboot, RebootMode};
            let mode = match kind {
                ShutdownKind::Poweroff => RebootMode::RB_POWER_OFF,
                ShutdownKind::Reboot => RebootMode::RB_AUTOBOOT,
                ShutdownKind::Halt => RebootMode::RB_HALT_SYSTEM,
            };
            if let Err(e) = reboot(mode) {
                error!(error = %e, "reboot(2) failed");
            }
        } else {
            info!("not pid 1, skipping reboot(2)");
        }
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
