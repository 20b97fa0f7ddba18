//! primus - process-1 init and service supervisor.
//!
//! Brings a machine from a bare kernel to a running userland and keeps
//! it there: early filesystem bring-up with ordered fsck, a declarative
//! line-oriented configuration, a supervision state machine with
//! respawn, condition and runlevel gating, and a control socket for
//! runtime commands.
//!
//! # Architecture
//!
//! - **Init** (`bootstrap`): sequences boot and owns the event loop
//! - **Registry** (`registry`): service records, declaration order
//! - **Supervisor** (`supervise`): the per-service state machine
//! - **CondStore** (`cond`): named boolean latches services gate on
//! - **Watcher** (`watcher`): inotify on configuration paths
//! - **ControlServer/Client** (`control`): runtime command channel
//! - **fs**: fsck passes, mounts, swap and the tmpfs finalize
//!
//! Everything runs on one thread; signals, child exits, fd readiness
//! and timers all arrive as events on the same loop.
//!
//! # Example
//!
//! ```no_run
//! use primus::{Init, SystemState};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut init = Init::new(SystemState::default());
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod cond;
pub mod conf;
pub mod control;
pub mod error;
pub mod fs;
pub mod hooks;
pub mod process;
pub mod reactor;
pub mod registry;
pub mod service;
pub mod supervise;
pub mod system;
pub mod watcher;

pub use bootstrap::{Init, ShutdownKind};
pub use cond::{CondState, CondStore};
pub use control::{Command, ControlClient, ControlServer, Reply};
pub use error::{Error, Result};
pub use process::{ExitEvent, Spawner, SystemSpawner};
pub use registry::Registry;
pub use service::{Service, ServiceKind, ServiceState};
pub use supervise::{StepFilter, Supervisor};
pub use system::{Runlevel, RunlevelMask, SystemState};
pub use watcher::Watcher;
