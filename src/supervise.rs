//! The supervision state machine.
//!
//! `step` drives one service toward where it should be given the current
//! runlevel, its conditions and its restart budget; `step_all` cranks
//! every record in declaration order. Stopping is two-phase (SIGTERM,
//! then SIGKILL once the grace period expires) and no new service starts
//! while anything is still stopping, so a runlevel transition downs the
//! old level before the new one comes up.

use crate::cond::CondStore;
use crate::process::Spawner;
use crate::registry::Registry;
use crate::service::{Service, ServiceKind, ServiceState, STOP_GRACE};
use crate::system::{Runlevel, SystemState};
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Which records a `step_all` pass touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFilter {
    /// Every record.
    Any,
    /// Respawning services only (`service` kind); used by finalize to
    /// bring up TTY-like daemons once bootstrap ends.
    Respawn,
}

impl StepFilter {
    fn matches(self, svc: &Service) -> bool {
        match self {
            StepFilter::Any => true,
            StepFilter::Respawn => svc.kind == ServiceKind::Service,
        }
    }
}

/// Why a crashed record is being given another chance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revival {
    Reload,
    RunlevelChange,
    ConditionChange,
}

/// The supervisor. Stateless apart from the stop grace period; all
/// per-service state lives on the records themselves.
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self { grace: STOP_GRACE }
    }
}

impl Supervisor {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Step every matching record, declaration order. Stop work happens
    /// first; starts are held back while any record is still stopping.
    pub fn step_all(
        &self,
        reg: &mut Registry,
        st: &SystemState,
        conds: &CondStore,
        spawner: &mut dyn Spawner,
        filter: StepFilter,
    ) {
        let idents = reg.idents();

        for ident in &idents {
            if let Some(svc) = reg.get_mut(ident) {
                if filter.matches(svc) {
                    self.step_down(svc, st, conds, spawner);
                }
            }
        }

        if reg.iter().any(|s| s.state == ServiceState::Stopping) {
            return;
        }

        for ident in &idents {
            let spawned = match reg.get_mut(ident) {
                Some(svc) if filter.matches(svc) => self.step_up(svc, st, conds, spawner),
                _ => None,
            };
            if let Some(pid) = spawned {
                reg.attach_pid(ident, pid);
            }
        }
    }

    /// Whether this record should have a live process right now.
    fn should_run(svc: &Service, st: &SystemState) -> bool {
        !svc.stop_requested && !svc.restart_pending && svc.in_runlevel(st.runlevel)
    }

    /// Downward transitions: initiate or escalate stops.
    fn step_down(
        &self,
        svc: &mut Service,
        st: &SystemState,
        conds: &CondStore,
        spawner: &mut dyn Spawner,
    ) {
        let wanted = Self::should_run(svc, st) && conds.satisfied(svc);

        match svc.state {
            ServiceState::Running if !wanted => {
                if let Some(pid) = svc.pid {
                    info!(service = %svc.ident(), pid, "stopping service");
                    if let Err(e) = spawner.kill(pid, Signal::SIGTERM) {
                        warn!(service = %svc.ident(), pid, error = %e, "SIGTERM failed");
                    }
                    svc.state = ServiceState::Stopping;
                    svc.next_action = Some(Instant::now() + self.grace);
                } else {
                    svc.state = ServiceState::Halted;
                }
            }
            ServiceState::Stopping => {
                let expired = svc.next_action.map_or(true, |t| t <= Instant::now());
                if expired {
                    if let Some(pid) = svc.pid {
                        warn!(service = %svc.ident(), pid, "grace period expired, sending SIGKILL");
                        if let Err(e) = spawner.kill(pid, Signal::SIGKILL) {
                            warn!(service = %svc.ident(), pid, error = %e, "SIGKILL failed");
                        }
                    } else {
                        svc.state = ServiceState::Halted;
                        svc.next_action = None;
                    }
                }
            }
            ServiceState::Waiting | ServiceState::Starting if !Self::should_run(svc, st) => {
                svc.state = ServiceState::Halted;
                svc.next_action = None;
            }
            _ => {}
        }
    }

    /// Upward transitions: waiting on conditions or backoff, then spawn.
    /// Returns a pid the caller must attach to the record.
    fn step_up(
        &self,
        svc: &mut Service,
        st: &SystemState,
        conds: &CondStore,
        spawner: &mut dyn Spawner,
    ) -> Option<u32> {
        if !matches!(svc.state, ServiceState::Halted | ServiceState::Waiting) {
            return None;
        }
        if !Self::should_run(svc, st) {
            return None;
        }

        if !conds.satisfied(svc) {
            if svc.state != ServiceState::Waiting {
                debug!(service = %svc.ident(), "conditions not satisfied, waiting");
                svc.state = ServiceState::Waiting;
            }
            return None;
        }

        // Restart backoff still running
        if let Some(release) = svc.next_action {
            if release > Instant::now() {
                svc.state = ServiceState::Waiting;
                return None;
            }
        }

        svc.state = ServiceState::Starting;
        match spawner.spawn(svc) {
            Ok(pid) => {
                svc.state = ServiceState::Running;
                svc.next_action = None;
                Some(pid)
            }
            Err(e) => {
                error!(service = %svc.ident(), error = %e, "spawn failed");
                svc.budget.try_restart();
                svc.state = ServiceState::Crashed;
                svc.next_action = None;
                None
            }
        }
    }

    /// Transition a record whose process was just reaped.
    pub fn handle_exit(&self, svc: &mut Service, st: &SystemState) {
        let exit = svc.exit;
        debug!(service = %svc.ident(), state = %svc.state, exit = ?exit, "service exited");

        match svc.state {
            ServiceState::Stopping => {
                svc.state = ServiceState::Halted;
                svc.next_action = None;
                svc.restart_pending = false;
            }
            ServiceState::Running | ServiceState::Starting => {
                if svc.kind.oneshot() {
                    svc.state = ServiceState::Done;
                    return;
                }
                if svc.restart_pending {
                    svc.state = ServiceState::Halted;
                    svc.restart_pending = false;
                } else if !Self::should_run(svc, st) {
                    svc.state = ServiceState::Halted;
                } else if svc.budget.try_restart() {
                    let backoff = svc.budget.backoff();
                    info!(service = %svc.ident(),
                          attempt = svc.budget.attempts(),
                          backoff_ms = backoff.as_millis() as u64,
                          "service exited, restarting");
                    svc.state = ServiceState::Waiting;
                    svc.next_action = Some(Instant::now() + backoff);
                } else {
                    warn!(service = %svc.ident(), "restart budget exhausted, giving up");
                    svc.state = ServiceState::Crashed;
                    svc.next_action = None;
                }
            }
            _ => {}
        }
    }

    /// Give crashed records another chance. Crashed is latched; only a
    /// reload, a runlevel change, or a change to one of the record's
    /// conditions unlatches it.
    pub fn revive_crashed(&self, reg: &mut Registry, reason: Revival, changed: &[String]) {
        for svc in reg.iter_mut() {
            if svc.state != ServiceState::Crashed {
                continue;
            }
            if reason == Revival::ConditionChange && !CondStore::affects(changed, svc) {
                continue;
            }
            info!(service = %svc.ident(), ?reason, "reviving crashed service");
            svc.state = ServiceState::Halted;
            svc.budget.reset();
        }
    }

    /// Bootstrap completion: every waited or bootstrap-tagged record
    /// eligible to run in `S` has reached a terminal state.
    pub fn service_completed(&self, reg: &Registry) -> bool {
        reg.iter()
            .filter(|s| s.kind == ServiceKind::Run || s.is_bootstrap())
            .filter(|s| s.in_runlevel(Runlevel::Bootstrap))
            .all(|s| matches!(s.state, ServiceState::Done | ServiceState::Crashed))
    }

    /// Earliest pending timed action (stop grace expiry or backoff
    /// release), for scheduling the next supervision tick.
    pub fn next_deadline(&self, reg: &Registry) -> Option<Duration> {
        let now = Instant::now();
        reg.iter()
            .filter(|s| matches!(s.state, ServiceState::Stopping | ServiceState::Waiting))
            .filter_map(|s| s.next_action)
            .map(|t| t.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::service::MAX_RESTARTS;

    /// Records every call; spawn can be made to fail per command.
    #[derive(Default)]
    pub struct FakeSpawner {
        pub next_pid: u32,
        pub spawned: Vec<String>,
        pub killed: Vec<(u32, Signal)>,
        pub fail: bool,
    }

    impl Spawner for FakeSpawner {
        fn spawn(&mut self, svc: &Service) -> Result<u32> {
            if self.fail {
                return Err(Error::SpawnFailed(svc.cmdline()));
            }
            self.next_pid += 1;
            self.spawned.push(svc.ident());
            Ok(self.next_pid)
        }

        fn kill(&mut self, pid: u32, sig: Signal) -> Result<()> {
            self.killed.push((pid, sig));
            Ok(())
        }
    }

    fn setup(level: u8) -> (SystemState, CondStore, FakeSpawner, Supervisor) {
        let mut st = SystemState::default();
        st.runlevel = Runlevel::Numbered(level);
        st.bootstrap = false;
        (st, CondStore::new(), FakeSpawner::default(), Supervisor::default())
    }

    #[test]
    fn starts_service_in_matching_runlevel() {
        let (st, conds, mut spawner, sup) = setup(3);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "[234] /bin/svc", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);

        let svc = reg.get("svc").unwrap();
        assert_eq!(svc.state, ServiceState::Running);
        assert_eq!(svc.pid, Some(1));
        assert!(svc.started_once);
    }

    #[test]
    fn skips_service_outside_runlevel() {
        let (st, conds, mut spawner, sup) = setup(9);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "[234] /bin/svc", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("svc").unwrap().state, ServiceState::Halted);
        assert!(spawner.spawned.is_empty());
    }

    #[test]
    fn waits_for_conditions_then_runs() {
        let (st, mut conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "<pid/foo> /bin/bar", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("bar").unwrap().state, ServiceState::Waiting);

        conds.set("pid/foo");
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("bar").unwrap().state, ServiceState::Running);
    }

    #[test]
    fn condition_loss_stops_running_service() {
        let (st, mut conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "<net/up> /bin/netd", None).unwrap();
        conds.set("net/up");
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("netd").unwrap().state, ServiceState::Running);

        conds.clear("net/up");
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        let svc = reg.get("netd").unwrap();
        assert_eq!(svc.state, ServiceState::Stopping);
        assert_eq!(spawner.killed, vec![(1, Signal::SIGTERM)]);
    }

    #[test]
    fn spawn_failure_crashes_record() {
        let (st, conds, mut spawner, sup) = setup(2);
        spawner.fail = true;
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "/bin/ghost", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("ghost").unwrap().state, ServiceState::Crashed);
    }

    #[test]
    fn flapping_service_exhausts_budget() {
        let (st, conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "/bin/flap", None).unwrap();

        // First start plus MAX_RESTARTS respawns, each exiting at once.
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        for _ in 0..=MAX_RESTARTS {
            let pid = reg.get("flap").unwrap().pid;
            if let Some(pid) = pid {
                let ident = reg.mark_exited(pid, Some(1), None).unwrap();
                sup.handle_exit(reg.get_mut(&ident).unwrap(), &st);
            }
            // Force any pending backoff to be due so the next step spawns.
            if let Some(svc) = reg.get_mut("flap") {
                if svc.state == ServiceState::Waiting {
                    svc.next_action = Some(Instant::now() - Duration::from_millis(1));
                }
            }
            sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        }

        let svc = reg.get("flap").unwrap();
        assert_eq!(svc.state, ServiceState::Crashed);
        assert!(svc.pid.is_none());
        let spawn_count = spawner.spawned.len();

        // No further spawns without an explicit revival.
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(spawner.spawned.len(), spawn_count);

        sup.revive_crashed(&mut reg, Revival::Reload, &[]);
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(spawner.spawned.len(), spawn_count + 1);
    }

    #[test]
    fn oneshots_reach_done_and_stay_there() {
        let mut st = SystemState::default();
        st.runlevel = Runlevel::Bootstrap;
        let conds = CondStore::new();
        let mut spawner = FakeSpawner::default();
        let sup = Supervisor::default();

        let mut reg = Registry::new();
        reg.register(ServiceKind::Task, "[S] /bin/mkdirs", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        let pid = reg.get("mkdirs").unwrap().pid.unwrap();
        let ident = reg.mark_exited(pid, Some(0), None).unwrap();
        sup.handle_exit(reg.get_mut(&ident).unwrap(), &st);
        assert_eq!(reg.get("mkdirs").unwrap().state, ServiceState::Done);

        // A second crank is a no-op: still done, no second spawn.
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("mkdirs").unwrap().state, ServiceState::Done);
        assert_eq!(spawner.spawned.len(), 1);
    }

    #[test]
    fn starts_are_gated_while_anything_stops() {
        let (mut st, conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "[2] name:old /bin/old", None).unwrap();
        reg.register(ServiceKind::Service, "[3] name:new /bin/new", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("old").unwrap().state, ServiceState::Running);

        st.prevlevel = Some(st.runlevel);
        st.runlevel = Runlevel::Numbered(3);
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);

        // old is stopping; new must not start yet
        assert_eq!(reg.get("old").unwrap().state, ServiceState::Stopping);
        assert_eq!(reg.get("new").unwrap().state, ServiceState::Halted);

        let pid = reg.get("old").unwrap().pid.unwrap();
        let ident = reg.mark_exited(pid, None, Some(15)).unwrap();
        sup.handle_exit(reg.get_mut(&ident).unwrap(), &st);
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);

        assert_eq!(reg.get("old").unwrap().state, ServiceState::Halted);
        assert_eq!(reg.get("new").unwrap().state, ServiceState::Running);
    }

    #[test]
    fn sigkill_after_grace_expires() {
        let (mut st, conds, mut spawner, _) = setup(2);
        let sup = Supervisor::new(Duration::from_millis(0));
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "[2] /bin/stubborn", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        st.runlevel = Runlevel::Numbered(4);
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("stubborn").unwrap().state, ServiceState::Stopping);

        // Grace of zero: next step escalates.
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert!(spawner.killed.contains(&(1, Signal::SIGKILL)));
    }

    #[test]
    fn step_all_is_idempotent_after_convergence() {
        let (st, conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "/bin/one", None).unwrap();
        reg.register(ServiceKind::Service, "<never/on> name:waiter /bin/two", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        let snapshot: Vec<_> = reg.iter().map(|s| (s.ident(), s.state, s.pid)).collect();
        let spawns = spawner.spawned.len();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        let again: Vec<_> = reg.iter().map(|s| (s.ident(), s.state, s.pid)).collect();
        assert_eq!(snapshot, again);
        assert_eq!(spawner.spawned.len(), spawns);
    }

    #[test]
    fn respawn_filter_skips_oneshots() {
        let (st, conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "name:daemon /bin/daemon", None).unwrap();
        reg.register(ServiceKind::Task, "name:job /bin/job", None).unwrap();

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Respawn);
        assert_eq!(reg.get("daemon").unwrap().state, ServiceState::Running);
        assert_eq!(reg.get("job").unwrap().state, ServiceState::Halted);
    }

    #[test]
    fn bootstrap_completion_tracks_runs_and_bootstrap_tasks() {
        let mut st = SystemState::default();
        st.runlevel = Runlevel::Bootstrap;
        let conds = CondStore::new();
        let mut spawner = FakeSpawner::default();
        let sup = Supervisor::default();

        let mut reg = Registry::new();
        reg.register(ServiceKind::Run, "[S] name:prep /bin/prep", None).unwrap();
        reg.register(ServiceKind::Task, "[S] name:setup /bin/setup", None).unwrap();
        reg.register(ServiceKind::Service, "[2345] /bin/later", None).unwrap();
        assert!(!sup.service_completed(&reg));

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert!(!sup.service_completed(&reg));

        for name in ["prep", "setup"] {
            let pid = reg.get(name).unwrap().pid.unwrap();
            let ident = reg.mark_exited(pid, Some(0), None).unwrap();
            sup.handle_exit(reg.get_mut(&ident).unwrap(), &st);
        }
        assert!(sup.service_completed(&reg));
    }

    #[test]
    fn reload_command_change_restarts_gracefully() {
        let (st, conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "/bin/svc -a", None).unwrap();
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        let old_pid = reg.get("svc").unwrap().pid.unwrap();

        reg.register(ServiceKind::Service, "/bin/svc -b", None).unwrap();
        assert!(reg.get("svc").unwrap().restart_pending);

        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
        assert_eq!(reg.get("svc").unwrap().state, ServiceState::Stopping);
        assert_eq!(spawner.killed, vec![(old_pid, Signal::SIGTERM)]);

        let ident = reg.mark_exited(old_pid, Some(0), None).unwrap();
        sup.handle_exit(reg.get_mut(&ident).unwrap(), &st);
        sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);

        let svc = reg.get("svc").unwrap();
        assert_eq!(svc.state, ServiceState::Running);
        assert!(!svc.restart_pending);
        assert_ne!(svc.pid, Some(old_pid));
    }

    #[test]
    fn never_more_than_one_live_pid() {
        let (st, conds, mut spawner, sup) = setup(2);
        let mut reg = Registry::new();
        reg.register(ServiceKind::Service, "/bin/svc", None).unwrap();

        for _ in 0..5 {
            sup.step_all(&mut reg, &st, &conds, &mut spawner, StepFilter::Any);
            reg.register(ServiceKind::Service, "/bin/svc", None).unwrap();
        }
        // One spawn total: the record was running the whole time.
        assert_eq!(spawner.spawned.len(), 1);
    }
}
