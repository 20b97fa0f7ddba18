//! End-to-end bootstrap flow over the parser, registry, condition store
//! and supervisor, driven with a fake spawner instead of fork/exec.

use primus::cond::CondStore;
use primus::conf;
use primus::error::Result;
use primus::registry::Registry;
use primus::service::{Service, ServiceKind, ServiceState};
use primus::supervise::{StepFilter, Supervisor};
use primus::system::{Runlevel, SystemState};
use primus::Spawner;
use nix::sys::signal::Signal;
use std::io::Write;

#[derive(Default)]
struct FakeSpawner {
    next_pid: u32,
    spawned: Vec<String>,
    killed: Vec<(u32, Signal)>,
}

impl Spawner for FakeSpawner {
    fn spawn(&mut self, svc: &Service) -> Result<u32> {
        self.next_pid += 1;
        self.spawned.push(svc.ident());
        Ok(self.next_pid)
    }

    fn kill(&mut self, pid: u32, sig: Signal) -> Result<()> {
        self.killed.push((pid, sig));
        Ok(())
    }
}

struct Harness {
    st: SystemState,
    reg: Registry,
    conds: CondStore,
    spawner: FakeSpawner,
    sup: Supervisor,
}

impl Harness {
    fn from_config(config: &str) -> Self {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.as_bytes()).unwrap();

        let mut st = SystemState::default();
        let mut reg = Registry::new();
        conf::parse_config(&mut st, &mut reg, file.path()).unwrap();

        Self {
            st,
            reg,
            conds: CondStore::new(),
            spawner: FakeSpawner::default(),
            sup: Supervisor::default(),
        }
    }

    fn step(&mut self) {
        let changed = self.conds.peek_changed();
        if !changed.is_empty() {
            self.sup.revive_crashed(
                &mut self.reg,
                primus::supervise::Revival::ConditionChange,
                &changed,
            );
        }
        self.sup.step_all(
            &mut self.reg,
            &self.st,
            &self.conds,
            &mut self.spawner,
            StepFilter::Any,
        );
        self.conds.drain_changed();
    }

    fn exit(&mut self, name: &str, code: i32) {
        let pid = self.reg.get(name).unwrap().pid.unwrap();
        let ident = self.reg.mark_exited(pid, Some(code), None).unwrap();
        self.sup.handle_exit(self.reg.get_mut(&ident).unwrap(), &self.st);
    }

    fn change_runlevel(&mut self, level: u8) {
        self.st.prevlevel = Some(self.st.runlevel);
        self.st.runlevel = Runlevel::Numbered(level);
        self.sup.revive_crashed(
            &mut self.reg,
            primus::supervise::Revival::RunlevelChange,
            &[],
        );
        self.step();
    }

    fn state_of(&self, name: &str) -> ServiceState {
        self.reg.get(name).unwrap().state
    }
}

#[test]
fn configured_runlevel_brings_service_up() {
    let mut h = Harness::from_config(
        "runlevel 3\n\
         service [234] /bin/svc\n",
    );
    assert_eq!(h.st.cfglevel, 3);

    // Bootstrap: runlevel S, nothing to do for a [234] service.
    h.step();
    assert_eq!(h.state_of("svc"), ServiceState::Halted);
    assert!(h.sup.service_completed(&h.reg));

    h.change_runlevel(h.st.target_level());
    assert_eq!(h.st.runlevel, Runlevel::Numbered(3));
    assert_eq!(h.state_of("svc"), ServiceState::Running);
}

#[test]
fn invalid_configured_runlevel_falls_back() {
    let h = Harness::from_config("runlevel 6\n");
    assert_eq!(h.st.cfglevel, 2);
}

#[test]
fn bootstrap_task_is_done_and_idempotent() {
    let mut h = Harness::from_config("task [S] /bin/mkdirs\n");

    h.step();
    assert_eq!(h.state_of("mkdirs"), ServiceState::Running);
    assert!(!h.sup.service_completed(&h.reg));

    h.exit("mkdirs", 0);
    assert_eq!(h.state_of("mkdirs"), ServiceState::Done);
    assert!(h.sup.service_completed(&h.reg));

    // Another full crank cycle leaves the record alone.
    h.step();
    h.step();
    assert_eq!(h.state_of("mkdirs"), ServiceState::Done);
    assert_eq!(h.spawner.spawned.len(), 1);
}

#[test]
fn bootstrap_prune_drops_unstarted_bootstrap_records() {
    let mut h = Harness::from_config(
        "task [S] <never/set> name:gated /bin/gated\n\
         task [S] name:ran /bin/ran\n",
    );

    h.step();
    assert_eq!(h.state_of("gated"), ServiceState::Waiting);
    h.exit("ran", 0);

    h.reg.prune_bootstrap();
    assert!(h.reg.get("gated").is_none());
    assert!(h.reg.get("ran").is_some());
}

#[test]
fn condition_gated_service_starts_within_one_step() {
    let mut h = Harness::from_config("service <pid/foo> /bin/bar\n");
    h.change_runlevel(2);
    assert_eq!(h.state_of("bar"), ServiceState::Waiting);

    h.conds.set("pid/foo");
    h.step();
    assert_eq!(h.state_of("bar"), ServiceState::Running);
}

#[test]
fn runlevel_transition_downs_old_before_new() {
    let mut h = Harness::from_config(
        "service [2] name:only2 /bin/only2\n\
         service [3] name:only3 /bin/only3\n\
         service [23] name:both /bin/both\n",
    );
    h.change_runlevel(2);
    assert_eq!(h.state_of("only2"), ServiceState::Running);
    assert_eq!(h.state_of("both"), ServiceState::Running);
    let both_pid = h.reg.get("both").unwrap().pid;

    h.change_runlevel(3);
    // only2 must be fully down before only3 starts.
    assert_eq!(h.state_of("only2"), ServiceState::Stopping);
    assert_eq!(h.state_of("only3"), ServiceState::Halted);
    let only2_pid = h.reg.get("only2").unwrap().pid.unwrap();
    assert!(h.spawner.killed.contains(&(only2_pid, Signal::SIGTERM)));

    h.exit("only2", 0);
    h.step();
    assert_eq!(h.state_of("only2"), ServiceState::Halted);
    assert_eq!(h.state_of("only3"), ServiceState::Running);
    // The overlapping service was never touched.
    assert_eq!(h.reg.get("both").unwrap().pid, both_pid);
}

#[test]
fn startx_runs_as_configured_user() {
    let h = Harness::from_config(
        "user kiosk\n\
         startx /usr/bin/xinit -- X session\n",
    );
    let svc = h.reg.get("xinit").unwrap();
    assert_eq!(svc.user.as_deref(), Some("kiosk"));
    assert_eq!(svc.kind, ServiceKind::Service);
}
