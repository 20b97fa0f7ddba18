//! Control command execution against the init driver.

use primus::error::Result;
use primus::service::{Service, ServiceKind, ServiceState};
use primus::system::Runlevel;
use primus::{Command, Init, Reply, ShutdownKind, Spawner, SystemState};
use nix::sys::signal::Signal;

#[derive(Default)]
struct FakeSpawner {
    next_pid: u32,
}

impl Spawner for FakeSpawner {
    fn spawn(&mut self, _svc: &Service) -> Result<u32> {
        self.next_pid += 1;
        Ok(self.next_pid)
    }

    fn kill(&mut self, _pid: u32, _sig: Signal) -> Result<()> {
        Ok(())
    }
}

fn init_at_level(level: u8) -> Init {
    let mut st = SystemState::default();
    st.runlevel = Runlevel::Numbered(level);
    st.bootstrap = false;
    Init::with_spawner(st, Box::new(FakeSpawner::default()))
}

#[tokio::test]
async fn runlevel_command_changes_level() {
    let mut init = init_at_level(2);
    match init.execute(Command::Runlevel { level: 3 }) {
        Reply::Ok { .. } => {}
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(init.state().runlevel, Runlevel::Numbered(3));
    assert_eq!(init.state().prevlevel, Some(Runlevel::Numbered(2)));
}

#[tokio::test]
async fn out_of_range_runlevel_is_rejected() {
    let mut init = init_at_level(2);
    match init.execute(Command::Runlevel { level: 10 }) {
        Reply::Err { message } => assert!(message.contains("10")),
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(init.state().runlevel, Runlevel::Numbered(2));
}

#[tokio::test]
async fn halt_and_reboot_levels_latch_shutdown() {
    let mut init = init_at_level(2);
    init.execute(Command::Runlevel { level: 0 });
    assert_eq!(init.pending_shutdown(), Some(ShutdownKind::Poweroff));

    let mut init = init_at_level(2);
    init.execute(Command::Runlevel { level: 6 });
    assert_eq!(init.pending_shutdown(), Some(ShutdownKind::Reboot));

    let mut init = init_at_level(2);
    init.execute(Command::Halt);
    assert_eq!(init.pending_shutdown(), Some(ShutdownKind::Halt));
}

#[tokio::test]
async fn start_stop_round_trip() {
    let mut init = init_at_level(2);
    init.registry_mut()
        .register(ServiceKind::Service, "[2345] /bin/svc", None)
        .unwrap();

    // Not yet stepped; a start command cranks the machine.
    match init.execute(Command::Start { name: "svc".into() }) {
        Reply::Ok { .. } => {}
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(init.registry().get("svc").unwrap().state, ServiceState::Running);

    init.execute(Command::Stop { name: "svc".into() });
    assert_eq!(init.registry().get("svc").unwrap().state, ServiceState::Stopping);
}

#[tokio::test]
async fn unknown_service_commands_error() {
    let mut init = init_at_level(2);
    for command in [
        Command::Start { name: "ghost".into() },
        Command::Stop { name: "ghost".into() },
        Command::Restart { name: "ghost".into() },
    ] {
        match init.execute(command) {
            Reply::Err { message } => assert!(message.contains("ghost")),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}

#[tokio::test]
async fn status_reports_registered_services() {
    let mut init = init_at_level(2);
    init.registry_mut()
        .register(ServiceKind::Service, "name:web /bin/httpd -- web server", None)
        .unwrap();
    init.registry_mut()
        .register(ServiceKind::Task, "[S] name:prep /bin/prep", None)
        .unwrap();

    match init.execute(Command::Status) {
        Reply::Status { services } => {
            assert_eq!(services.len(), 2);
            assert_eq!(services[0].ident, "web");
            assert_eq!(services[0].kind, "service");
            assert_eq!(services[0].description.as_deref(), Some("web server"));
            assert_eq!(services[1].ident, "prep");
            assert_eq!(services[1].kind, "task");
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn restart_flags_running_service() {
    let mut init = init_at_level(2);
    init.registry_mut()
        .register(ServiceKind::Service, "/bin/svc", None)
        .unwrap();
    init.execute(Command::Start { name: "svc".into() });
    let pid = init.registry().get("svc").unwrap().pid.unwrap();

    init.execute(Command::Restart { name: "svc".into() });
    // Graceful restart: the old process is asked to stop first.
    let svc = init.registry().get("svc").unwrap();
    assert_eq!(svc.state, ServiceState::Stopping);
    assert_eq!(svc.pid, Some(pid));
}
