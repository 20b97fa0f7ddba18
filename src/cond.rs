//! Condition store: named boolean latches services gate on.
//!
//! Names are hierarchical, slash-separated (`pid/sshd`, `hook/basefs-up`).
//! Unknown names read as off. Oneshot conditions assert immediately and
//! clear themselves once the change has propagated through a supervisor
//! step.

use crate::service::Service;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Observable state of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CondState {
    On,
    Off,
    /// Mid-transition, e.g. during a reload; gates nothing yet.
    Flux,
}

/// The store itself. All mutation happens on the main loop, so a plain
/// map is enough; a supervisor step observes either the state before a
/// set of changes or after, never a partial update.
#[derive(Debug, Default)]
pub struct CondStore {
    conds: HashMap<String, CondState>,
    oneshot: HashSet<String>,
    changed: Vec<String>,
}

impl CondStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; unknown names are off.
    pub fn get(&self, name: &str) -> CondState {
        self.conds.get(name).copied().unwrap_or(CondState::Off)
    }

    /// Assert a condition.
    pub fn set(&mut self, name: &str) {
        let prev = self.conds.insert(name.to_string(), CondState::On);
        if prev != Some(CondState::On) {
            self.changed.push(name.to_string());
        }
    }

    /// Retract a condition.
    pub fn clear(&mut self, name: &str) {
        let prev = self.conds.insert(name.to_string(), CondState::Off);
        if prev == Some(CondState::On) {
            self.changed.push(name.to_string());
        }
        self.oneshot.remove(name);
    }

    /// Assert a condition that clears itself after one propagation.
    pub fn set_oneshot(&mut self, name: &str) {
        self.set(name);
        self.oneshot.insert(name.to_string());
    }

    /// Mark a condition as mid-transition, e.g. while a reload decides
    /// its fate. Gating treats flux the same as off; the owner is
    /// expected to settle it with `set` or `clear`.
    pub fn set_flux(&mut self, name: &str) {
        let prev = self.conds.insert(name.to_string(), CondState::Flux);
        if prev == Some(CondState::On) {
            self.changed.push(name.to_string());
        }
        self.oneshot.remove(name);
    }

    /// All conditions a service requires are asserted.
    pub fn satisfied(&self, svc: &Service) -> bool {
        svc.conditions.iter().all(|c| self.get(c) == CondState::On)
    }

    /// Names changed since the last drain, without draining. The
    /// supervisor uses this to revive crashed services before a step
    /// while oneshot conditions are still asserted.
    pub fn peek_changed(&self) -> Vec<String> {
        self.changed.clone()
    }

    /// Names changed since the last drain. Draining also retires oneshot
    /// conditions: they have propagated, so they flip back to off without
    /// re-notifying.
    pub fn drain_changed(&mut self) -> Vec<String> {
        let changed = std::mem::take(&mut self.changed);
        for name in self.oneshot.drain() {
            self.conds.insert(name, CondState::Off);
        }
        changed
    }

    /// Whether any pending change intersects the service's condition set.
    pub fn affects(changed: &[String], svc: &Service) -> bool {
        svc.conditions.iter().any(|c| changed.iter().any(|n| n == c))
    }

    /// Pending changes exist that a step has not yet observed.
    pub fn dirty(&self) -> bool {
        !self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;

    #[test]
    fn unknown_names_read_off() {
        let store = CondStore::new();
        assert_eq!(store.get("pid/nonesuch"), CondState::Off);
    }

    #[test]
    fn set_and_clear() {
        let mut store = CondStore::new();
        store.set("net/up");
        assert_eq!(store.get("net/up"), CondState::On);
        store.clear("net/up");
        assert_eq!(store.get("net/up"), CondState::Off);
        assert_eq!(store.drain_changed(), vec!["net/up", "net/up"]);
    }

    #[test]
    fn redundant_set_does_not_renotify() {
        let mut store = CondStore::new();
        store.set("a");
        store.set("a");
        assert_eq!(store.drain_changed().len(), 1);
    }

    #[test]
    fn oneshot_clears_after_drain() {
        let mut store = CondStore::new();
        store.set_oneshot("hook/banner");
        assert_eq!(store.get("hook/banner"), CondState::On);
        let changed = store.drain_changed();
        assert_eq!(changed, vec!["hook/banner"]);
        assert_eq!(store.get("hook/banner"), CondState::Off);
        assert!(store.drain_changed().is_empty());
    }

    #[test]
    fn flux_reads_back_and_gates_as_not_on() {
        let mut store = CondStore::new();
        let svc = Service::parse(ServiceKind::Service, "<net/up> /bin/x", None).unwrap();
        store.set("net/up");
        assert!(store.satisfied(&svc));

        store.set_flux("net/up");
        assert_eq!(store.get("net/up"), CondState::Flux);
        assert!(!store.satisfied(&svc));
        assert_eq!(store.drain_changed(), vec!["net/up", "net/up"]);
    }

    #[test]
    fn satisfied_and_affects() {
        let mut store = CondStore::new();
        let svc = Service::parse(ServiceKind::Service, "<pid/foo> /bin/bar", None).unwrap();
        assert!(!store.satisfied(&svc));
        store.set("pid/foo");
        assert!(store.satisfied(&svc));

        let changed = store.drain_changed();
        assert!(CondStore::affects(&changed, &svc));
        let other = Service::parse(ServiceKind::Service, "<net/up> /bin/x", None).unwrap();
        assert!(!CondStore::affects(&changed, &other));
    }
}
