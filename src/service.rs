//! Service record types: kind, lifecycle state, restart budget and the
//! declarative spec grammar.
//!
//! A spec string looks like:
//!
//! ```text
//! [2345] <pid/netd> name:sshd pid:!/run/sshd.pid @root /usr/sbin/sshd -D -- OpenSSH daemon
//! ```
//!
//! with every part optional except the command. The leading bracket group
//! is the runlevel mask, the angle group the required conditions, then
//! `name:`, `:instance`, `pid`/`pid:`, `cgroup.`, and `@user` options in
//! any order before the executable path.

use crate::error::{Error, Result};
use crate::system::{Runlevel, RunlevelMask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Grace period between SIGTERM and SIGKILL when stopping a service.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Restart budget: at most this many restarts per [`RESTART_WINDOW`].
pub const MAX_RESTARTS: u32 = 10;

/// Window over which restarts are counted.
pub const RESTART_WINDOW: Duration = Duration::from_secs(60);

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const BACKOFF_JITTER_MS: u64 = 100;

/// How a record is executed and supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Monitored daemon, respawned on exit.
    Service,
    /// One-shot job, not respawned, not waited for.
    Task,
    /// One-shot job the bootstrap driver waits for.
    Run,
    /// Script-style SysV job.
    Sysv,
}

impl ServiceKind {
    /// One-shot kinds terminate in `Done` instead of respawning.
    pub fn oneshot(self) -> bool {
        matches!(self, ServiceKind::Task | ServiceKind::Run | ServiceKind::Sysv)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Service => write!(f, "service"),
            ServiceKind::Task => write!(f, "task"),
            ServiceKind::Run => write!(f, "run"),
            ServiceKind::Sysv => write!(f, "sysv"),
        }
    }
}

/// Lifecycle state of a service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not running and not scheduled to run.
    Halted,
    /// Conditions not yet satisfied, or waiting out a restart backoff.
    Waiting,
    /// Between the decision to start and a successful spawn.
    Starting,
    /// Process is alive.
    Running,
    /// SIGTERM sent, waiting for exit (SIGKILL after the grace period).
    Stopping,
    /// Restart budget exhausted; latched until reload, condition or
    /// runlevel change.
    Crashed,
    /// Terminal state for a one-shot that completed.
    Done,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Halted => "halted",
            ServiceState::Waiting => "waiting",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Crashed => "crashed",
            ServiceState::Done => "done",
        };
        f.write_str(s)
    }
}

/// How the last process for a record exited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if killed.
    pub signal: Option<i32>,
    /// When the exit was reaped.
    pub at: DateTime<Utc>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Sliding-window restart rate limit with exponential backoff.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    attempts: Vec<Instant>,
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartBudget {
    pub fn new() -> Self {
        Self { attempts: Vec::new() }
    }

    fn prune(&mut self, now: Instant) {
        self.attempts
            .retain(|t| now.duration_since(*t) < RESTART_WINDOW);
    }

    /// Record a restart attempt; false when the budget is exhausted.
    pub fn try_restart(&mut self) -> bool {
        let now = Instant::now();
        self.prune(now);
        if self.attempts.len() >= MAX_RESTARTS as usize {
            return false;
        }
        self.attempts.push(now);
        true
    }

    /// Restarts recorded in the current window.
    pub fn attempts(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Delay before the next restart: `min(max, base * 2^attempts)` plus
    /// up to 100 ms of jitter so flapping services do not thunder in step.
    pub fn backoff(&self) -> Duration {
        let n = self.attempts.len().min(16) as u32;
        let exp = BACKOFF_BASE
            .checked_mul(1u32 << n)
            .unwrap_or(BACKOFF_MAX)
            .min(BACKOFF_MAX);
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::from(d.subsec_micros()) % BACKOFF_JITTER_MS)
            .unwrap_or(0);
        exp + Duration::from_millis(jitter)
    }

    /// Forget all recorded attempts.
    pub fn reset(&mut self) {
        self.attempts.clear();
    }
}

/// A resource limit applied to a service's children before exec.
///
/// The resource name uses the lowercase `RLIMIT_*` suffix: `nofile`,
/// `core`, `cpu`, `data`, `fsize`, `memlock`, `nproc`, `stack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    pub resource: String,
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    /// Parse `NAME SOFT [HARD]`; `unlimited` and `infinity` both mean
    /// no limit. The hard limit defaults to the soft one.
    pub fn parse(arg: &str) -> Result<Self> {
        fn value(tok: &str) -> Result<u64> {
            match tok {
                "unlimited" | "infinity" => Ok(u64::MAX),
                _ => tok
                    .parse()
                    .map_err(|_| Error::Config(format!("bad rlimit value: {}", tok))),
            }
        }

        let mut parts = arg.split_whitespace();
        let resource = parts
            .next()
            .ok_or_else(|| Error::Config("empty rlimit".into()))?
            .to_string();
        let soft = value(
            parts
                .next()
                .ok_or_else(|| Error::Config(format!("rlimit {} without value", resource)))?,
        )?;
        let hard = match parts.next() {
            Some(tok) => value(tok)?,
            None => soft,
        };
        Ok(Rlimit { resource, soft, hard })
    }
}

/// A pid file declared with the `pid`/`pid:` option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidFile {
    pub path: PathBuf,
    /// Created and removed by us; `pid:!...` marks the file as owned by
    /// the service itself.
    pub managed: bool,
}

impl PidFile {
    /// Parse a `pid` option for the service command `cmd`.
    ///
    /// `pid` uses `/run/<basename>.pid`; `pid:foo` becomes
    /// `/run/foo.pid` (`.pid` appended unless already present); absolute
    /// paths are used verbatim. A leading `!` disables management.
    pub fn parse(arg: &str, cmd: &Path) -> Result<Self> {
        let rest = match arg.strip_prefix("pid") {
            Some("") => {
                let base = cmd
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| Error::InvalidSpec(format!("pid option for bad command {:?}", cmd)))?;
                return Ok(PidFile {
                    path: PathBuf::from(format!("/run/{}.pid", base)),
                    managed: true,
                });
            }
            Some(r) => r
                .strip_prefix(':')
                .ok_or_else(|| Error::InvalidSpec(format!("bad pid option: {}", arg)))?,
            None => return Err(Error::InvalidSpec(format!("bad pid option: {}", arg))),
        };

        let (managed, rest) = match rest.strip_prefix('!') {
            Some(r) => (false, r),
            None => (true, rest),
        };
        if rest.is_empty() {
            return Err(Error::InvalidSpec(format!("bad pid option: {}", arg)));
        }

        let path = if rest.starts_with('/') {
            PathBuf::from(rest)
        } else if rest.ends_with(".pid") {
            PathBuf::from(format!("/run/{}", rest))
        } else {
            PathBuf::from(format!("/run/{}.pid", rest))
        };

        Ok(PidFile { path, managed })
    }

    fn to_option(&self) -> String {
        if self.managed {
            format!("pid:{}", self.path.display())
        } else {
            format!("pid:!{}", self.path.display())
        }
    }
}

/// A supervised service record.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub instance: Option<String>,
    pub kind: ServiceKind,
    pub cmd: PathBuf,
    pub args: Vec<String>,
    pub levels: RunlevelMask,
    pub conditions: Vec<String>,
    pub user: Option<String>,
    pub workdir: Option<PathBuf>,
    pub cgroup: Option<String>,
    pub pidfile: Option<PidFile>,
    pub rlimits: Vec<Rlimit>,
    pub description: Option<String>,

    pub state: ServiceState,
    pub pid: Option<u32>,
    pub exit: Option<ExitInfo>,
    pub started_at: Option<DateTime<Utc>>,
    pub budget: RestartBudget,

    /// Operator or runlevel change asked this record to stop.
    pub stop_requested: bool,
    /// Ever successfully spawned; bootstrap-only records that never did
    /// are pruned at finalize.
    pub started_once: bool,
    /// SIGKILL deadline while `Stopping`, or backoff release while
    /// `Waiting` after a restart.
    pub next_action: Option<Instant>,
    /// Command line changed on reload; triggers a graceful restart.
    pub restart_pending: bool,
    /// Present in the most recent configuration pass (reload diffing).
    pub seen: bool,
}

impl Service {
    /// Parse a spec string into a fresh record.
    ///
    /// `default_user` supplies the identity for `startx`-style
    /// registrations; an explicit `@user` token wins.
    pub fn parse(kind: ServiceKind, spec: &str, default_user: Option<&str>) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::InvalidSpec("empty spec".into()));
        }

        let mut levels = None;
        let mut conditions = Vec::new();
        let mut name = None;
        let mut instance = None;
        let mut user = default_user.map(str::to_string);
        let mut workdir = None;
        let mut cgroup = None;
        let mut pid_opt: Option<String> = None;
        let mut cmd: Option<PathBuf> = None;
        let mut args = Vec::new();
        let mut description: Option<String> = None;

        let mut tokens = spec.split_whitespace();
        while let Some(tok) = tokens.next() {
            if cmd.is_some() {
                if tok == "--" {
                    let rest: Vec<&str> = tokens.by_ref().collect();
                    if !rest.is_empty() {
                        description = Some(rest.join(" "));
                    }
                    break;
                }
                args.push(tok.to_string());
                continue;
            }

            if let Some(inner) = tok.strip_prefix('[') {
                let inner = inner
                    .strip_suffix(']')
                    .ok_or_else(|| Error::InvalidSpec(format!("unterminated mask: {}", tok)))?;
                levels = Some(RunlevelMask::parse(inner)?);
            } else if let Some(inner) = tok.strip_prefix('<') {
                let inner = inner
                    .strip_suffix('>')
                    .ok_or_else(|| Error::InvalidSpec(format!("unterminated condition list: {}", tok)))?;
                conditions = inner
                    .split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
            } else if let Some(n) = tok.strip_prefix("name:") {
                if n.is_empty() {
                    return Err(Error::InvalidSpec("empty name: option".into()));
                }
                name = Some(n.to_string());
            } else if let Some(id) = tok.strip_prefix(':') {
                if id.is_empty() {
                    return Err(Error::InvalidSpec("empty :instance option".into()));
                }
                instance = Some(id.to_string());
            } else if tok == "pid" || tok.starts_with("pid:") {
                pid_opt = Some(tok.to_string());
            } else if let Some(dir) = tok.strip_prefix("cwd:") {
                if !dir.starts_with('/') {
                    return Err(Error::InvalidSpec(format!("cwd must be absolute: {}", dir)));
                }
                workdir = Some(PathBuf::from(dir));
            } else if let Some(cg) = tok.strip_prefix("cgroup.") {
                if cg.is_empty() {
                    return Err(Error::InvalidSpec("empty cgroup option".into()));
                }
                cgroup = Some(cg.to_string());
            } else if let Some(u) = tok.strip_prefix('@') {
                if u.is_empty() {
                    return Err(Error::InvalidSpec("empty @user option".into()));
                }
                user = Some(u.to_string());
            } else {
                cmd = Some(PathBuf::from(tok));
            }
        }

        let cmd = cmd.ok_or_else(|| Error::InvalidSpec(format!("no command in spec: {}", spec)))?;
        let pidfile = match pid_opt {
            Some(opt) => Some(PidFile::parse(&opt, &cmd)?),
            None => None,
        };
        let name = match name {
            Some(n) => n,
            None => cmd
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::InvalidSpec(format!("bad command path: {}", cmd.display())))?
                .to_string(),
        };
        let levels = levels.unwrap_or(RunlevelMask::DEFAULT);

        Ok(Service {
            name,
            instance,
            kind,
            cmd,
            args,
            levels,
            conditions,
            user,
            workdir,
            cgroup,
            pidfile,
            rlimits: Vec::new(),
            description,
            state: ServiceState::Halted,
            pid: None,
            exit: None,
            started_at: None,
            budget: RestartBudget::new(),
            stop_requested: false,
            started_once: false,
            next_action: None,
            restart_pending: false,
            seen: true,
        })
    }

    /// Unique identity: `name` or `name:instance`.
    pub fn ident(&self) -> String {
        match &self.instance {
            Some(id) => format!("{}:{}", self.name, id),
            None => self.name.clone(),
        }
    }

    /// Full command line, for reload comparison and logging.
    pub fn cmdline(&self) -> String {
        let mut s = self.cmd.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }

    /// Declared only for the bootstrap level `S`.
    pub fn is_bootstrap(&self) -> bool {
        self.levels.bootstrap_only()
    }

    /// Allowed to run in `level`.
    pub fn in_runlevel(&self, level: Runlevel) -> bool {
        self.levels.contains(level)
    }

    /// Process currently alive (running, or being stopped).
    pub fn has_pid(&self) -> bool {
        self.pid.is_some()
    }

    /// Serialize back to the spec grammar. `parse` of the result yields
    /// an equal definition.
    pub fn to_spec(&self) -> String {
        let mut out = format!("[{}]", self.levels);
        if !self.conditions.is_empty() {
            out.push_str(&format!(" <{}>", self.conditions.join(",")));
        }
        out.push_str(&format!(" name:{}", self.name));
        if let Some(id) = &self.instance {
            out.push_str(&format!(" :{}", id));
        }
        if let Some(pf) = &self.pidfile {
            out.push(' ');
            out.push_str(&pf.to_option());
        }
        if let Some(dir) = &self.workdir {
            out.push_str(&format!(" cwd:{}", dir.display()));
        }
        if let Some(cg) = &self.cgroup {
            out.push_str(&format!(" cgroup.{}", cg));
        }
        if let Some(u) = &self.user {
            out.push_str(&format!(" @{}", u));
        }
        out.push(' ');
        out.push_str(&self.cmd.display().to_string());
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        if let Some(d) = &self.description {
            out.push_str(&format!(" -- {}", d));
        }
        out
    }

    /// Definition fields equal, ignoring runtime state.
    pub fn same_definition(&self, other: &Service) -> bool {
        self.name == other.name
            && self.instance == other.instance
            && self.kind == other.kind
            && self.cmd == other.cmd
            && self.args == other.args
            && self.levels == other.levels
            && self.conditions == other.conditions
            && self.user == other.user
            && self.workdir == other.workdir
            && self.cgroup == other.cgroup
            && self.pidfile == other.pidfile
            && self.description == other.description
    }
}
