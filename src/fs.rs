//! Filesystem bring-up: early virtual mounts, ordered fsck, root
//! remount, `mount -a`, swap and the tmpfs finalize pass.
//!
//! The sequence is fixed and runs before the event loop starts. Anything
//! unrecoverable here drops to sulogin with reboot-on-exit; everything
//! else logs and keeps booting.

use crate::error::{Error, Result};
use crate::hooks::{Hook, HookRegistry};
use crate::process::{run_and_wait, which};
use crate::system::SystemState;
use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sys::stat::{umask, Mode};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// One fstab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub fsname: String,
    pub dir: String,
    pub fstype: String,
    pub opts: Vec<String>,
    pub freq: u32,
    pub passno: u32,
}

impl FstabEntry {
    pub fn has_opt(&self, opt: &str) -> bool {
        self.opts.iter().any(|o| o == opt)
    }
}

/// Parse an fstab file. Comments and blank lines are skipped; short
/// lines are logged and skipped, the boot continues.
pub fn parse_fstab(path: &Path) -> Result<Vec<FstabEntry>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Fstab {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(parse_fstab_str(&content))
}

fn parse_fstab_str(content: &str) -> Vec<FstabEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            warn!(line, "malformed fstab line, skipping");
            continue;
        }
        entries.push(FstabEntry {
            fsname: fields[0].to_string(),
            dir: fields[1].to_string(),
            fstype: fields[2].to_string(),
            opts: fields
                .get(3)
                .map(|o| o.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            freq: fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(0),
            passno: fields.get(5).and_then(|f| f.parse().ok()).unwrap_or(0),
        });
    }
    entries
}

/// Seam for the fsck invocation so pass ordering is testable without
/// block devices.
pub trait FsckRunner {
    /// Run fsck on `device`, returning its exit code.
    fn fsck(&mut self, device: &str) -> i32;
}

/// Invokes the real `fsck -a`.
#[derive(Debug, Default)]
pub struct SystemFsck;

impl FsckRunner for SystemFsck {
    fn fsck(&mut self, device: &str) -> i32 {
        run_and_wait(
            &format!("fsck -a {}", device),
            &format!("Checking filesystem {}", device),
        )
    }
}

/// Check one fsck pass. Devices that cannot be resolved to something
/// checkable are skipped, as are filesystems already mounted read-write.
/// An exit code above 1 is unrecoverable.
fn fsck_pass(entries: &[FstabEntry], pass: u32, runner: &mut dyn FsckRunner) -> Result<i32> {
    let mut rc = 0;

    for entry in entries.iter().filter(|e| e.passno == pass) {
        let Some(device) = resolve_device(&entry.fsname) else {
            debug!(device = %entry.fsname, "cannot fsck, not a block device");
            continue;
        };

        if is_mounted_rw(&entry.dir) {
            debug!(device = %device, dir = %entry.dir, "already mounted rw, skipping fsck");
            continue;
        }

        debug!(pass, device = %device, "running fsck");
        let code = runner.fsck(&device);
        // Exit code 1 means errors were corrected and boot may proceed;
        // anything above that is unrecoverable.
        if code > 1 {
            error!(device = %device, code, "fsck failed");
            return Err(Error::FsckFatal { device, code });
        }
        rc += code;
    }

    Ok(rc)
}

/// Run fsck passes 1..9 in order. A non-zero result from any pass stops
/// later passes; a fatal error propagates for the sulogin fallback.
pub fn fsck_all(entries: &[FstabEntry], runner: &mut dyn FsckRunner) -> Result<i32> {
    for pass in 1..10 {
        let rc = fsck_pass(entries, pass, runner)?;
        if rc != 0 {
            return Ok(rc);
        }
    }
    Ok(0)
}

/// Run the legacy `check DEV` directive: fsck one device ahead of the
/// fstab-driven passes, warning when the two overlap.
pub fn check_device(dev: &str, fstab: &Path) {
    if let Ok(entries) = parse_fstab(fstab) {
        if entries.iter().any(|e| e.fsname == dev && e.passno > 0) {
            warn!(device = dev, "check directive overlaps fstab passno, device will be checked twice");
        }
    }
    run_and_wait(
        &format!("fsck -a {}", dev),
        &format!("Checking filesystem {}", dev),
    );
}

/// Resolve an fstab device spec to something fsck can check.
///
/// `UUID=`/`LABEL=` pass through verbatim, fsck resolves those itself.
/// The kernel short form `/dev/root` is resolved through /sys/block by
/// matching the root device's major:minor, since the symlink cannot be
/// relied on. Plain paths must exist as block devices.
fn resolve_device(fsname: &str) -> Option<String> {
    use nix::sys::stat::{stat, SFlag};

    if fsname.starts_with("UUID=") || fsname.starts_with("LABEL=") {
        return Some(fsname.to_string());
    }
    if fsname == "/dev/root" {
        return root_device().map(|p| p.display().to_string());
    }

    let st = stat(fsname).ok()?;
    let is_blk = st.st_mode & SFlag::S_IFMT.bits() == SFlag::S_IFBLK.bits();
    is_blk.then(|| fsname.to_string())
}

/// Find the real device backing `/` by scanning /sys/block for a
/// matching major:minor.
pub fn root_device() -> Option<PathBuf> {
    use nix::sys::stat::{stat, SFlag};

    let st = stat("/").ok()?;
    let dev = if st.st_mode & SFlag::S_IFMT.bits() == SFlag::S_IFBLK.bits() {
        st.st_rdev
    } else {
        st.st_dev
    };
    let (major, minor) = (nix::sys::stat::major(dev), nix::sys::stat::minor(dev));

    for entry in std::fs::read_dir("/sys/block").ok()?.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Ok(numbers) = std::fs::read_to_string(entry.path().join("dev")) else {
            continue;
        };
        let mut parts = numbers.trim().split(':');
        let maj: u64 = parts.next().and_then(|p| p.parse().ok())?;
        let min: u64 = parts.next().and_then(|p| p.parse().ok())?;
        if maj == major && min == minor {
            // Guess the name, assuming no renaming
            return Some(PathBuf::from("/dev").join(name));
        }
    }
    None
}

/// Whether `dir` is a mount point per /proc/mounts.
pub fn is_mounted(dir: &str) -> bool {
    mounts_entry(dir).is_some()
}

/// Whether `dir` is mounted read-write.
pub fn is_mounted_rw(dir: &str) -> bool {
    mounts_entry(dir)
        .map(|opts| opts.split(',').any(|o| o == "rw"))
        .unwrap_or(false)
}

fn mounts_entry(dir: &str) -> Option<String> {
    let mounts = std::fs::read_to_string("/proc/mounts").ok()?;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _fsname = fields.next()?;
        if fields.next()? == dir {
            let _fstype = fields.next()?;
            return Some(fields.next()?.to_string());
        }
    }
    None
}

/// Thin wrapper for mount(2): EBUSY is fine (the kernel or an initramfs
/// beat us to it), anything else is logged.
pub fn fs_mount(src: &str, target: &str, fstype: Option<&str>, flags: MsFlags, data: Option<&str>) {
    match mount(Some(src), target, fstype, flags, data) {
        Ok(()) => {
            info!(source = src, target, fstype = fstype.unwrap_or("-"), "mounted filesystem");
        }
        Err(Errno::EBUSY) => {}
        Err(errno) => {
            warn!(source = src, target, error = %errno, "mount failed");
        }
    }
}

fn makedir(path: &str, mode: u32) {
    let p = Path::new(path);
    if p.is_dir() {
        return;
    }
    if let Err(e) = std::fs::DirBuilder::new().mode(mode).create(p) {
        warn!(path, error = %e, "failed creating mount point");
    }
}

/// Mount /proc, /dev and /sys before anything else needs them. Skips
/// filesystems that are already mounted (containers, initramfs).
pub fn early_mounts() {
    umask(Mode::from_bits_truncate(0o022));

    for (spec, file, fstype) in [
        ("proc", "/proc", "proc"),
        ("devtmpfs", "/dev", "devtmpfs"),
        ("sysfs", "/sys", "sysfs"),
    ] {
        if is_mounted(file) {
            continue;
        }
        fs_mount(spec, file, Some(fstype), MsFlags::empty(), None);
    }
}

/// Remount `/` read-write unless fstab lists it `ro` or fsck failed.
fn remount_root(entries: &[FstabEntry], fsck_rc: i32) {
    let Some(root) = entries.iter().find(|e| e.dir == "/") else {
        return;
    };
    if root.has_opt("ro") {
        return;
    }
    if fsck_rc != 0 {
        warn!("cannot remount / read-write, fsck reported errors");
        return;
    }
    run_and_wait("mount -n -o remount,rw /", "Remounting / as read-write");
}

/// Enable every swap entry from fstab.
fn swapon_all(entries: &[FstabEntry]) {
    if which("swapon").is_none() {
        return;
    }
    for entry in entries.iter().filter(|e| e.fstype == "swap") {
        run_and_wait(
            &format!("swapon {}", entry.fsname),
            &format!("Enabling swap {}", entry.fsname),
        );
    }
}

/// Opinionated finalize: make sure the common tmpfs mounts exist, each
/// only when not already mounted (an fstab entry wins).
fn finalize_mounts() {
    if !is_mounted("/dev/shm") {
        makedir("/dev/shm", 0o777);
        fs_mount("shm", "/dev/shm", Some("tmpfs"), MsFlags::empty(), Some("mode=0777"));
    }

    if !is_mounted("/dev/pts") {
        let gid = nix::unistd::Group::from_name("tty")
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
            .unwrap_or(0);
        // 0620 rather than 0600 to get mesg y by default
        let opts = format!("gid={},mode=620,ptmxmode=0666", gid);
        makedir("/dev/pts", 0o755);
        fs_mount(
            "devpts",
            "/dev/pts",
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some(&opts),
        );
    }

    if Path::new("/run").is_dir() && !is_mounted("/run") {
        fs_mount(
            "tmpfs",
            "/run",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME,
            Some("mode=0755,size=10%"),
        );
        // Separate small tmpfs so filling /run/lock cannot DoS /run
        makedir("/run/lock", 0o1777);
        fs_mount(
            "tmpfs",
            "/run/lock",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME,
            Some("mode=0777,size=5252880"),
        );
    }

    if !is_mounted("/tmp") {
        fs_mount(
            "tmpfs",
            "/tmp",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=1777"),
        );
    }
}

/// The full bring-up: fstab (with fallback), fsck passes, root remount,
/// `mount -a`, swap, finalize, with hooks at the named points.
pub fn mount_all(st: &mut SystemState, hooks: &mut HookRegistry, runner: &mut dyn FsckRunner) {
    if !st.fstab.exists() {
        warn!(fstab = %st.fstab.display(), "cannot find fstab, trying fallback");
        st.fstab = PathBuf::from(crate::system::FSTAB_FILE);
    }
    if !st.fstab.exists() {
        error!(fstab = %st.fstab.display(), "no usable fstab, attempting sulogin");
        sulogin(true);
        return;
    }

    // Needed by fsck; left in the environment for mount helpers and any
    // tool that expects it after booting with a non-default fstab.
    std::env::set_var("FSTAB_FILE", &st.fstab);

    let entries = match parse_fstab(&st.fstab) {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "failed reading fstab, attempting sulogin");
            sulogin(true);
            return;
        }
    };

    if !st.rescue {
        match fsck_all(&entries, runner) {
            Ok(rc) => remount_root(&entries, rc),
            Err(e) => {
                error!(error = %e, "attempting sulogin");
                sulogin(true);
            }
        }
    }

    debug!("root filesystem up, calling hooks");
    hooks.run(Hook::RootfsUp, st);

    let cmd = if st.fstab == Path::new(crate::system::FSTAB_FILE) {
        "mount -na".to_string()
    } else {
        format!("mount -na -T {}", st.fstab.display())
    };
    if run_and_wait(&cmd, &format!("Mounting filesystems from {}", st.fstab.display())) != 0 {
        hooks.run(Hook::MountError, st);
    }

    hooks.run(Hook::MountPost, st);

    swapon_all(&entries);
    finalize_mounts();
}

/// Invoke the single-user login shell on unrecoverable early-boot
/// errors. With `reboot_after` the machine reboots once the shell exits;
/// this path never returns.
pub fn sulogin(reboot_after: bool) -> i32 {
    let rc = match which("sulogin").or_else(|| which("sh")) {
        Some(path) => run_and_wait(
            &path.display().to_string(),
            "Starting emergency shell",
        ),
        None => {
            error!("no sulogin or sh found for emergency shell");
            71
        }
    };

    if reboot_after {
        if std::process::id() == 1 {
            unsafe { libc::sync() };
            let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT);
        }
        std::process::exit(rc);
    }

    rc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fsname: &str, dir: &str, fstype: &str, passno: u32) -> FstabEntry {
        FstabEntry {
            fsname: fsname.to_string(),
            dir: dir.to_string(),
            fstype: fstype.to_string(),
            opts: vec!["defaults".to_string()],
            freq: 0,
            passno,
        }
    }

    #[derive(Default)]
    struct FakeFsck {
        calls: Vec<String>,
        codes: std::collections::HashMap<String, i32>,
    }

    impl FsckRunner for FakeFsck {
        fn fsck(&mut self, device: &str) -> i32 {
            self.calls.push(device.to_string());
            self.codes.get(device).copied().unwrap_or(0)
        }
    }

    #[test]
    fn parses_fstab_lines() {
        let entries = parse_fstab_str(
            "# comment\n\
             \n\
             UUID=abcd / ext4 defaults,ro 0 1\n\
             /dev/sdb1 /data xfs defaults 0 2\n\
             tmpfs /tmp tmpfs mode=1777\n\
             broken-line\n",
        );
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].fsname, "UUID=abcd");
        assert!(entries[0].has_opt("ro"));
        assert_eq!(entries[0].passno, 1);
        assert_eq!(entries[1].passno, 2);
        assert_eq!(entries[2].passno, 0);
    }

    #[test]
    fn fsck_runs_passes_in_order() {
        let entries = vec![
            entry("UUID=second", "/fsck-data", "ext4", 2),
            entry("UUID=first", "/fsck-root", "ext4", 1),
            entry("UUID=never", "/fsck-skip", "ext4", 0),
        ];
        let mut runner = FakeFsck::default();
        let rc = fsck_all(&entries, &mut runner).unwrap();
        assert_eq!(rc, 0);
        assert_eq!(runner.calls, vec!["UUID=first", "UUID=second"]);
    }

    #[test]
    fn nonzero_pass_stops_later_passes() {
        let entries = vec![
            entry("UUID=root", "/fsck-root", "ext4", 1),
            entry("UUID=data", "/fsck-data", "ext4", 2),
        ];
        let mut runner = FakeFsck::default();
        runner.codes.insert("UUID=root".to_string(), 1);
        let rc = fsck_all(&entries, &mut runner).unwrap();
        assert_eq!(rc, 1);
        assert_eq!(runner.calls, vec!["UUID=root"]);
    }

    #[test]
    fn fatal_fsck_code_is_an_error() {
        let entries = vec![entry("UUID=bad", "/fsck-root", "ext4", 1)];
        let mut runner = FakeFsck::default();
        runner.codes.insert("UUID=bad".to_string(), 4);
        let err = fsck_all(&entries, &mut runner).unwrap_err();
        match err {
            Error::FsckFatal { device, code } => {
                assert_eq!(device, "UUID=bad");
                assert_eq!(code, 4);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn unresolvable_devices_are_skipped() {
        let entries = vec![entry("/dev/does-not-exist", "/mnt", "ext4", 1)];
        let mut runner = FakeFsck::default();
        let rc = fsck_all(&entries, &mut runner).unwrap();
        assert_eq!(rc, 0);
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn uuid_and_label_pass_through() {
        assert_eq!(resolve_device("UUID=xyz").as_deref(), Some("UUID=xyz"));
        assert_eq!(resolve_device("LABEL=root").as_deref(), Some("LABEL=root"));
        assert!(resolve_device("/nonexistent/device").is_none());
    }
}
