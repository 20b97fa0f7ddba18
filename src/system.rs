//! System-wide runtime state: runlevels, configured scalars, boot flags.
//!
//! The original design kept these as process globals; here they live in a
//! single owned [`SystemState`] whose lifetime is bound to the bootstrap
//! driver, and every component borrows it explicitly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default runlevel to enter after bootstrap when nothing else is configured.
pub const DEFAULT_RUNLEVEL: u8 = 2;

/// Static configuration file.
pub const CONF_FILE: &str = "/etc/primus.conf";

/// Include directory, parsed after [`CONF_FILE`] in sorted order.
pub const CONF_DIR: &str = "/etc/primus.d";

/// System fstab consumed by filesystem bring-up.
pub const FSTAB_FILE: &str = "/etc/fstab";

/// SysV-compat script executed at the tail end of bootstrap.
pub const RC_LOCAL: &str = "/etc/rc.local";

/// Directory for bundled helper daemons (watchdogd, keventd).
pub const LIBEXEC_DIR: &str = "/usr/libexec/primus";

/// A runlevel: the synthetic bootstrap level `S`, or a numbered level 0..9.
///
/// 0 halts, 6 reboots, 1 is rescue; 2..5 and 7..9 are ordinary levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runlevel {
    /// Synthetic bootstrap level, written `S`.
    Bootstrap,
    /// Numbered level 0..=9.
    Numbered(u8),
}

impl Runlevel {
    /// Parse a single runlevel character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'S' | 's' => Some(Runlevel::Bootstrap),
            '0'..='9' => Some(Runlevel::Numbered(c as u8 - b'0')),
            _ => None,
        }
    }

    fn bit(self) -> u16 {
        match self {
            Runlevel::Bootstrap => 1 << 10,
            Runlevel::Numbered(n) => 1 << n,
        }
    }
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runlevel::Bootstrap => write!(f, "S"),
            Runlevel::Numbered(n) => write!(f, "{}", n),
        }
    }
}

/// Bitset of runlevels a service is allowed to run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunlevelMask(u16);

impl RunlevelMask {
    /// Empty mask, member of no runlevel.
    pub const EMPTY: Self = RunlevelMask(0);

    /// Default mask for services declared without one: levels 2-5.
    pub const DEFAULT: Self = RunlevelMask(0b0011_1100);

    /// Parse the inside of a `[...]` runlevel mask, e.g. `2345` or `S12`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut mask = 0u16;
        for c in s.chars() {
            let level = Runlevel::from_char(c)
                .ok_or_else(|| Error::InvalidRunlevel(s.to_string()))?;
            mask |= level.bit();
        }
        if mask == 0 {
            return Err(Error::InvalidRunlevel(s.to_string()));
        }
        Ok(RunlevelMask(mask))
    }

    /// Whether `level` is a member of this mask.
    pub fn contains(&self, level: Runlevel) -> bool {
        self.0 & level.bit() != 0
    }

    /// True when the mask names only the bootstrap level `S`.
    pub fn bootstrap_only(&self) -> bool {
        self.0 == Runlevel::Bootstrap.bit()
    }

    /// True when the mask includes the bootstrap level.
    pub fn has_bootstrap(&self) -> bool {
        self.contains(Runlevel::Bootstrap)
    }
}

impl fmt::Display for RunlevelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_bootstrap() {
            write!(f, "S")?;
        }
        for n in 0..=9u8 {
            if self.contains(Runlevel::Numbered(n)) {
                write!(f, "{}", n)?;
            }
        }
        Ok(())
    }
}

/// A console TTY line declared in configuration, handled by an external
/// TTY collaborator once bootstrap completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyLine {
    pub device: String,
    pub baud: u32,
}

/// Owned system-wide state, created by `main` and threaded through the
/// bootstrap driver to every component.
#[derive(Debug, Clone)]
pub struct SystemState {
    /// Current runlevel; starts in bootstrap `S`.
    pub runlevel: Runlevel,
    /// Previous runlevel, if a transition has happened.
    pub prevlevel: Option<Runlevel>,
    /// Configured default runlevel; always 1..=9 and never 6.
    pub cfglevel: u8,
    /// Runlevel override from the kernel command line or telinit.
    pub cmdlevel: Option<u8>,

    /// Debug logging requested from the kernel command line.
    pub debug: bool,
    /// Rescue mode: sulogin before bootstrap, skip rc scripts.
    pub rescue: bool,
    /// Single-user mode requested from the kernel command line.
    pub single: bool,
    /// True while bootstrapping; cleared by finalize.
    pub bootstrap: bool,

    /// Default user identity for `startx` services.
    pub username: Option<String>,
    /// Configured system hostname.
    pub hostname: Option<String>,
    /// Command used to bring up networking.
    pub network: Option<String>,
    /// Directory of boot scripts executed after bootstrap.
    pub runparts: Option<PathBuf>,
    /// Command to run on shutdown.
    pub sdown: Option<String>,
    /// Console device.
    pub console: Option<String>,
    /// Declared TTY lines, attached by the TTY collaborator.
    pub ttys: Vec<TtyLine>,

    /// fstab consumed by filesystem bring-up.
    pub fstab: PathBuf,
    /// Static configuration file.
    pub conf_file: PathBuf,
    /// Include directory for `*.conf` fragments.
    pub conf_dir: PathBuf,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            runlevel: Runlevel::Bootstrap,
            prevlevel: None,
            cfglevel: DEFAULT_RUNLEVEL,
            cmdlevel: None,
            debug: false,
            rescue: false,
            single: false,
            bootstrap: true,
            username: None,
            hostname: None,
            network: None,
            runparts: None,
            sdown: None,
            console: None,
            ttys: Vec::new(),
            fstab: PathBuf::from(FSTAB_FILE),
            conf_file: PathBuf::from(CONF_FILE),
            conf_dir: PathBuf::from(CONF_DIR),
        }
    }
}

impl SystemState {
    /// Set the configured default runlevel, clamping invalid input.
    ///
    /// Accepts 1..=9 except 6; anything else, including unparseable
    /// input, falls back to [`DEFAULT_RUNLEVEL`].
    pub fn set_cfglevel(&mut self, arg: &str) {
        let level = arg.trim().parse::<u8>().unwrap_or(0);
        if (1..=9).contains(&level) && level != 6 {
            self.cfglevel = level;
        } else {
            self.cfglevel = DEFAULT_RUNLEVEL;
        }
    }

    /// The runlevel to enter when bootstrap completes: the command-line
    /// override when present, the configured default otherwise.
    pub fn target_level(&self) -> u8 {
        self.cmdlevel.unwrap_or(self.cfglevel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_parses_numbered_levels() {
        let mask = RunlevelMask::parse("2345").unwrap();
        assert!(mask.contains(Runlevel::Numbered(2)));
        assert!(mask.contains(Runlevel::Numbered(5)));
        assert!(!mask.contains(Runlevel::Numbered(1)));
        assert!(!mask.contains(Runlevel::Bootstrap));
    }

    #[test]
    fn mask_parses_bootstrap() {
        let mask = RunlevelMask::parse("S").unwrap();
        assert!(mask.bootstrap_only());
        assert!(mask.contains(Runlevel::Bootstrap));

        let mixed = RunlevelMask::parse("S12345789").unwrap();
        assert!(!mixed.bootstrap_only());
        assert!(mixed.has_bootstrap());
    }

    #[test]
    fn mask_rejects_garbage() {
        assert!(RunlevelMask::parse("x").is_err());
        assert!(RunlevelMask::parse("").is_err());
    }

    #[test]
    fn mask_display_round_trips() {
        for spec in ["2345", "S", "S2345", "0123456789"] {
            let mask = RunlevelMask::parse(spec).unwrap();
            assert_eq!(RunlevelMask::parse(&mask.to_string()).unwrap(), mask);
        }
    }

    #[test]
    fn cfglevel_clamps_halt_and_reboot() {
        let mut st = SystemState::default();
        st.set_cfglevel("3");
        assert_eq!(st.cfglevel, 3);
        st.set_cfglevel("6");
        assert_eq!(st.cfglevel, 2);
        st.set_cfglevel("0");
        assert_eq!(st.cfglevel, 2);
        st.set_cfglevel("10");
        assert_eq!(st.cfglevel, 2);
        st.set_cfglevel("bogus");
        assert_eq!(st.cfglevel, 2);
    }

    #[test]
    fn target_level_prefers_cmdline() {
        let mut st = SystemState::default();
        st.cfglevel = 3;
        assert_eq!(st.target_level(), 3);
        st.cmdlevel = Some(9);
        assert_eq!(st.target_level(), 9);
    }
}
