//! Service registry: owns every service record, in declaration order,
//! with secondary lookup by name and by pid.

use crate::error::{Error, Result};
use crate::service::{ExitInfo, Rlimit, Service, ServiceKind, ServiceState};
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// The registry. Records are created by the config parser, mutated by the
/// state machine and reloads, and destroyed on reload when they no longer
/// appear in configuration and are terminal.
#[derive(Debug, Default)]
pub struct Registry {
    services: IndexMap<String, Service>,
    pids: HashMap<u32, String>,
    default_rlimits: Vec<Rlimit>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service from its spec string.
    ///
    /// An already-present identity has its definition updated in place
    /// without touching the running process; the next supervisor step
    /// reconciles. A kind change is handled as stop-then-recreate: the
    /// old process is asked to stop and the record restarts fresh under
    /// the new kind.
    pub fn register(
        &mut self,
        kind: ServiceKind,
        spec: &str,
        default_user: Option<&str>,
    ) -> Result<&Service> {
        let mut fresh = Service::parse(kind, spec, default_user)?;
        fresh.rlimits = self.default_rlimits.clone();
        let ident = fresh.ident();

        match self.services.get_mut(&ident) {
            Some(existing) => {
                if existing.kind != fresh.kind && existing.has_pid() {
                    info!(service = %ident, from = %existing.kind, to = %fresh.kind,
                          "service kind changed, stopping for recreate");
                    existing.stop_requested = true;
                } else if existing.cmdline() != fresh.cmdline() && existing.has_pid() {
                    info!(service = %ident, "command line changed, scheduling restart");
                    existing.restart_pending = true;
                }
                existing.kind = fresh.kind;
                existing.cmd = fresh.cmd;
                existing.args = fresh.args;
                existing.levels = fresh.levels;
                existing.conditions = fresh.conditions;
                existing.user = fresh.user;
                existing.workdir = fresh.workdir;
                existing.cgroup = fresh.cgroup;
                existing.pidfile = fresh.pidfile;
                existing.rlimits = fresh.rlimits;
                existing.description = fresh.description;
                existing.seen = true;
                debug!(service = %ident, "updated service definition");
            }
            None => {
                debug!(service = %ident, kind = %fresh.kind, "registered service");
                self.services.insert(ident.clone(), fresh);
            }
        }

        Ok(&self.services[&ident])
    }

    /// Look up by name and optional instance.
    pub fn find(&self, name: &str, instance: Option<&str>) -> Option<&Service> {
        let ident = ident_of(name, instance);
        self.services.get(&ident)
    }

    pub fn find_mut(&mut self, name: &str, instance: Option<&str>) -> Option<&mut Service> {
        let ident = ident_of(name, instance);
        self.services.get_mut(&ident)
    }

    pub fn get(&self, ident: &str) -> Option<&Service> {
        self.services.get(ident)
    }

    pub fn get_mut(&mut self, ident: &str) -> Option<&mut Service> {
        self.services.get_mut(ident)
    }

    /// The record owning a live pid.
    pub fn by_pid(&self, pid: u32) -> Option<&Service> {
        self.pids.get(&pid).and_then(|id| self.services.get(id))
    }

    /// Declaration-order iteration.
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.services.values_mut()
    }

    /// Identities in declaration order; for stepping without holding a
    /// borrow across mutation.
    pub fn idents(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Bind a freshly spawned pid to its record.
    pub fn attach_pid(&mut self, ident: &str, pid: u32) {
        if let Some(svc) = self.services.get_mut(ident) {
            svc.pid = Some(pid);
            svc.started_once = true;
            svc.started_at = Some(Utc::now());
            self.pids.insert(pid, ident.to_string());
        }
    }

    /// Record a reaped child. Resolves pid to the owning record, stores
    /// exit info and detaches the pid. Returns the identity for the
    /// state machine to transition, or `None` for an unknown pid (an
    /// orphan we inherited as pid 1).
    pub fn mark_exited(&mut self, pid: u32, code: Option<i32>, signal: Option<i32>) -> Option<String> {
        let ident = self.pids.remove(&pid)?;
        let svc = self.services.get_mut(&ident)?;
        svc.pid = None;
        svc.exit = Some(ExitInfo {
            code,
            signal,
            at: Utc::now(),
        });
        Some(ident)
    }

    /// Drop bootstrap-only records that never started. Called once when
    /// bootstrap finalizes.
    pub fn prune_bootstrap(&mut self) {
        let doomed: Vec<String> = self
            .services
            .iter()
            .filter(|(_, s)| s.is_bootstrap() && !s.started_once && !s.has_pid())
            .map(|(id, _)| id.clone())
            .collect();
        for ident in doomed {
            debug!(service = %ident, "pruning bootstrap-only service that never ran");
            self.services.shift_remove(&ident);
        }
    }

    /// Set or replace a default resource limit applied to every record
    /// registered from here on. Same-resource entries replace.
    pub fn push_default_rlimit(&mut self, rlimit: Rlimit) {
        self.default_rlimits.retain(|r| r.resource != rlimit.resource);
        self.default_rlimits.push(rlimit);
    }

    /// Begin a reload pass: every record is unseen until re-registered
    /// and the default resource limits are re-collected.
    pub fn begin_reload(&mut self) {
        for svc in self.services.values_mut() {
            svc.seen = false;
        }
        self.default_rlimits.clear();
    }

    /// Finish a reload pass: records absent from the new configuration
    /// are removed once terminal, or asked to stop otherwise.
    pub fn finish_reload(&mut self) -> Vec<String> {
        let mut removed = Vec::new();
        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|(_, s)| !s.seen)
            .map(|(id, _)| id.clone())
            .collect();
        for ident in stale {
            let svc = &mut self.services[&ident];
            if svc.has_pid() {
                info!(service = %ident, "removed from configuration, stopping");
                svc.stop_requested = true;
            } else {
                warn!(service = %ident, "removed from configuration, dropping record");
                self.services.shift_remove(&ident);
                removed.push(ident);
            }
        }
        removed
    }
}

fn ident_of(name: &str, instance: Option<&str>) -> String {
    match instance {
        Some(id) => format!("{}:{}", name, id),
        None => name.to_string(),
    }
}
