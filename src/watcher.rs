//! Inotify watcher for configuration files and directories.
//!
//! Thin wrapper over [`nix::sys::inotify`]. The watcher owns the kernel
//! fd and one entry per watched path; each entry owns its path string
//! exclusively and is freed only when removed from the set. Watching a
//! path that does not exist is a successful no-op so callers can retry
//! from parent-directory events later.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default event mask: create, delete, moves, modify and attrib.
pub const DEFAULT_MASK: AddWatchFlags = AddWatchFlags::IN_CREATE
    .union(AddWatchFlags::IN_DELETE)
    .union(AddWatchFlags::IN_MOVED_FROM)
    .union(AddWatchFlags::IN_MOVED_TO)
    .union(AddWatchFlags::IN_MODIFY)
    .union(AddWatchFlags::IN_ATTRIB);

/// A single kernel watch and the path it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub wd: WatchDescriptor,
    pub path: PathBuf,
}

/// A decoded inotify event.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Watched path the event fired on.
    pub path: PathBuf,
    /// Name within a watched directory, when present.
    pub name: Option<PathBuf>,
    pub mask: AddWatchFlags,
}

/// The watcher. Disabled until [`Watcher::init`] succeeds; every other
/// call fails with [`Error::WatcherClosed`] before that.
#[derive(Debug, Default)]
pub struct Watcher {
    inner: Option<Inotify>,
    entries: Vec<WatchEntry>,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the kernel inotify instance. Returns the pollable fd.
    pub fn init(&mut self) -> Result<RawFd> {
        if let Some(inotify) = &self.inner {
            return Ok(inotify.as_fd().as_raw_fd());
        }
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        let fd = inotify.as_fd().as_raw_fd();
        self.inner = Some(inotify);
        Ok(fd)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    /// The pollable fd, for readiness registration.
    pub fn as_raw_fd(&self) -> Result<RawFd> {
        self.inner
            .as_ref()
            .map(|i| i.as_fd().as_raw_fd())
            .ok_or(Error::WatcherClosed)
    }

    /// Watch `path` with [`DEFAULT_MASK`] plus `extra_mask`. Success
    /// without effect when the path does not exist. A path already
    /// watched keeps its existing entry.
    pub fn add(&mut self, path: &Path, extra_mask: AddWatchFlags) -> Result<()> {
        let inotify = self.inner.as_ref().ok_or(Error::WatcherClosed)?;

        if !path.exists() {
            debug!(path = %path.display(), "skipping watch, no such file or directory");
            return Ok(());
        }
        if self.entries.iter().any(|e| e.path == path) {
            return Ok(());
        }

        let wd = match inotify.add_watch(path, DEFAULT_MASK | extra_mask) {
            Ok(wd) => wd,
            Err(errno) => {
                warn!(path = %path.display(), error = %errno, "failed adding watch");
                return Err(errno.into());
            }
        };

        debug!(path = %path.display(), wd = ?wd, "added watch");
        self.entries.push(WatchEntry {
            wd,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Stop watching `path` and free its entry.
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        let inotify = self.inner.as_ref().ok_or(Error::WatcherClosed)?;
        let Some(pos) = self.entries.iter().position(|e| e.path == path) else {
            return Ok(());
        };
        let entry = self.entries.remove(pos);
        if let Err(errno) = inotify.rm_watch(entry.wd) {
            warn!(path = %entry.path.display(), error = %errno, "failed removing watch");
        }
        debug!(path = %entry.path.display(), "removed watch");
        Ok(())
    }

    pub fn find_by_wd(&self, wd: WatchDescriptor) -> Option<&WatchEntry> {
        self.entries.iter().find(|e| e.wd == wd)
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&WatchEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Read and decode all pending events, without blocking.
    pub fn drain(&mut self) -> Result<Vec<WatchEvent>> {
        let inotify = self.inner.as_ref().ok_or(Error::WatcherClosed)?;
        let mut events = Vec::new();

        loop {
            match inotify.read_events() {
                Ok(batch) => {
                    for ev in batch {
                        if let Some(entry) = self.entries.iter().find(|e| e.wd == ev.wd) {
                            events.push(WatchEvent {
                                path: entry.path.clone(),
                                name: ev.name.map(PathBuf::from),
                                mask: ev.mask,
                            });
                        }
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(errno) => return Err(errno.into()),
            }
        }

        Ok(events)
    }

    /// Remove all kernel watches and close the fd. The watcher goes back
    /// to the uninitialized state.
    pub fn teardown(&mut self) {
        if let Some(inotify) = self.inner.take() {
            for entry in self.entries.drain(..) {
                let _ = inotify.rm_watch(entry.wd);
            }
            // fd closes when the Inotify drops
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.teardown();
    }
}
