//! Machine fingerprint: several OS signals joined in a fixed order and hashed
//! into a [`StableDeviceId`].
//!
//! Probing never fails. A signal that cannot be read degrades to a sentinel,
//! which makes such a machine less uniquely bound but still fingerprintable.

use cvault_core::{VaultError, VaultResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const NO_MACHINE_ID: &str = "no-machine-id";
pub const NO_USB: &str = "no-usb";
pub const NO_MAC: &str = "no-mac";

/// One source of machine-identifying signals per operating system.
pub trait SignalProbe: Send + Sync {
    fn machine_id(&self) -> Option<String>;

    /// Serial of the removable volume the running binary lives on.
    fn usb_serial(&self) -> Option<String>;

    /// MAC of the primary physical interface.
    fn network_mac(&self) -> Option<String>;

    fn hostname(&self) -> Option<String> {
        hostname::get().ok().and_then(|h| h.into_string().ok())
    }

    fn platform(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn arch(&self) -> String {
        std::env::consts::ARCH.to_string()
    }
}

/// Signals collected from one machine. Only the hash is ever bound into a
/// license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub machine_id: String,
    pub platform: String,
    pub arch: String,
    pub usb_serial: Option<String>,
    pub network_mac: Option<String>,
    /// Informational only; not part of the hash.
    pub hostname: String,
}

impl DeviceFingerprint {
    pub fn collect(probe: &dyn SignalProbe) -> Self {
        let fp = Self {
            machine_id: probe
                .machine_id()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| NO_MACHINE_ID.to_string()),
            platform: probe.platform(),
            arch: probe.arch(),
            usb_serial: probe.usb_serial().filter(|s| !s.is_empty()),
            network_mac: probe
                .network_mac()
                .filter(|s| !s.is_empty())
                .map(|m| m.to_ascii_lowercase()),
            hostname: probe.hostname().unwrap_or_default(),
        };
        tracing::debug!(
            platform = %fp.platform,
            arch = %fp.arch,
            has_usb = fp.usb_serial.is_some(),
            has_mac = fp.network_mac.is_some(),
            "collected device fingerprint"
        );
        fp
    }

    /// `machineId|platform|arch|usb|mac`, sentinels substituted for missing
    /// signals.
    pub fn canonical_string(&self) -> String {
        [
            self.machine_id.as_str(),
            self.platform.as_str(),
            self.arch.as_str(),
            self.usb_serial.as_deref().unwrap_or(NO_USB),
            self.network_mac.as_deref().unwrap_or(NO_MAC),
        ]
        .join("|")
    }

    pub fn stable_id(&self) -> StableDeviceId {
        StableDeviceId(Sha256::digest(self.canonical_string().as_bytes()).into())
    }
}

/// SHA-256 of a fingerprint's canonical string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StableDeviceId([u8; 32]);

impl StableDeviceId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> VaultResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| VaultError::Format(format!("machine hash: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VaultError::Format("machine hash must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for StableDeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StableDeviceId({})", self.to_hex())
    }
}

impl std::fmt::Display for StableDeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for StableDeviceId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for StableDeviceId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        StableDeviceId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Probe for the platform this binary was compiled for.
#[cfg(target_os = "macos")]
pub fn platform_probe() -> Box<dyn SignalProbe> {
    Box::new(MacProbe)
}

/// Probe for the platform this binary was compiled for.
#[cfg(target_os = "windows")]
pub fn platform_probe() -> Box<dyn SignalProbe> {
    Box::new(WindowsProbe)
}

/// Probe for the platform this binary was compiled for.
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn platform_probe() -> Box<dyn SignalProbe> {
    Box::new(LinuxProbe::default())
}

/// Fixed signals. Used by tests and by hosts that gather signals themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub machine_id: Option<String>,
    pub usb_serial: Option<String>,
    pub network_mac: Option<String>,
    pub hostname: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
}

impl StaticProbe {
    pub fn new(machine_id: &str) -> Self {
        Self {
            machine_id: Some(machine_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_usb_serial(mut self, serial: &str) -> Self {
        self.usb_serial = Some(serial.to_string());
        self
    }

    pub fn with_network_mac(mut self, mac: &str) -> Self {
        self.network_mac = Some(mac.to_string());
        self
    }
}

impl SignalProbe for StaticProbe {
    fn machine_id(&self) -> Option<String> {
        self.machine_id.clone()
    }

    fn usb_serial(&self) -> Option<String> {
        self.usb_serial.clone()
    }

    fn network_mac(&self) -> Option<String> {
        self.network_mac.clone()
    }

    fn hostname(&self) -> Option<String> {
        self.hostname.clone()
    }

    fn platform(&self) -> String {
        self.platform
            .clone()
            .unwrap_or_else(|| std::env::consts::OS.to_string())
    }

    fn arch(&self) -> String {
        self.arch
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string())
    }
}

// ── Linux ────────────────────────────────────────────────────────────────

/// Reads machine-id, block-device links under `/dev/disk/by-id` and
/// `/sys/class/net`. Paths are configurable so the probe can run against a
/// fake root.
#[derive(Debug, Clone)]
pub struct LinuxProbe {
    pub root: PathBuf,
}

impl Default for LinuxProbe {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }
}

impl LinuxProbe {
    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    /// Block device backing the mount that contains `target`.
    fn mount_device_for(&self, target: &Path) -> Option<String> {
        let mounts = std::fs::read_to_string(self.path("/proc/self/mounts")).ok()?;
        best_mount_device(&mounts, target)
    }
}

impl SignalProbe for LinuxProbe {
    fn machine_id(&self) -> Option<String> {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .filter_map(|p| std::fs::read_to_string(self.path(p)).ok())
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
    }

    fn usb_serial(&self) -> Option<String> {
        let exe = std::env::current_exe().ok()?;
        let device = self.mount_device_for(&exe)?;
        let device = std::fs::canonicalize(self.path(&device)).ok()?;

        let by_id = std::fs::read_dir(self.path("/dev/disk/by-id")).ok()?;
        let mut names: Vec<String> = by_id
            .filter_map(|e| e.ok())
            .filter(|e| {
                std::fs::canonicalize(e.path())
                    .map(|target| target == device)
                    .unwrap_or(false)
            })
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with("usb-"))
            .collect();
        names.sort();
        names.into_iter().next().map(|n| usb_serial_from_by_id(&n))
    }

    fn network_mac(&self) -> Option<String> {
        let net = self.path("/sys/class/net");
        let mut candidates: Vec<(String, String)> = std::fs::read_dir(&net)
            .ok()?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                if name == "lo" {
                    return None;
                }
                let real = std::fs::canonicalize(e.path()).ok()?;
                if real.to_string_lossy().contains("/virtual/") {
                    return None;
                }
                let mac = std::fs::read_to_string(e.path().join("address")).ok()?;
                let mac = mac.trim().to_ascii_lowercase();
                is_usable_mac(&mac).then_some((name, mac))
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next().map(|(_, mac)| mac)
    }
}

/// Longest mount point that prefixes `target` wins.
fn best_mount_device(mounts: &str, target: &Path) -> Option<String> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?.replace("\\040", " ");
            (device.starts_with("/dev/") && target.starts_with(&mount_point))
                .then(|| (mount_point.len(), device.to_string()))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, device)| device)
}

/// `usb-Vendor_Model_SERIAL-0:0-part1` → `SERIAL`
fn usb_serial_from_by_id(name: &str) -> String {
    let body = name.trim_start_matches("usb-");
    let body = body.split("-part").next().unwrap_or(body);
    let body = body.rsplit_once('-').map(|(b, _lun)| b).unwrap_or(body);
    body.rsplit('_').next().unwrap_or(body).to_string()
}

fn is_usable_mac(mac: &str) -> bool {
    mac.len() == 17 && mac != "00:00:00:00:00:00"
}

// ── macOS ────────────────────────────────────────────────────────────────

/// Shells out to `ioreg`, `diskutil` and `ifconfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MacProbe;

impl SignalProbe for MacProbe {
    fn machine_id(&self) -> Option<String> {
        let out = run("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"])?;
        parse_ioreg_uuid(&out)
    }

    fn usb_serial(&self) -> Option<String> {
        let exe = std::env::current_exe().ok()?;
        let volume = macos_volume_root(&exe)?;
        let out = run("diskutil", &["info", volume.to_str()?])?;
        parse_diskutil_uuid(&out)
    }

    fn network_mac(&self) -> Option<String> {
        let out = run("ifconfig", &["en0"])?;
        parse_ifconfig_ether(&out)
    }
}

fn parse_ioreg_uuid(out: &str) -> Option<String> {
    out.lines()
        .find(|l| l.contains("\"IOPlatformUUID\""))
        .and_then(|l| l.split('=').nth(1))
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// `/Volumes/NAME/...` → `/Volumes/NAME`. Binaries on the boot volume have no
/// removable serial.
fn macos_volume_root(exe: &Path) -> Option<PathBuf> {
    let mut components = exe.components();
    components.next()?;
    let volumes = components.next()?;
    if volumes.as_os_str() != "Volumes" {
        return None;
    }
    let name = components.next()?;
    Some(Path::new("/Volumes").join(name))
}

fn parse_diskutil_uuid(out: &str) -> Option<String> {
    ["Volume UUID:", "Disk / Partition UUID:"]
        .iter()
        .find_map(|key| {
            out.lines()
                .find_map(|l| l.trim().strip_prefix(key).map(|v| v.trim().to_string()))
        })
        .filter(|v| !v.is_empty())
}

fn parse_ifconfig_ether(out: &str) -> Option<String> {
    out.lines()
        .find_map(|l| l.trim().strip_prefix("ether "))
        .map(|v| v.split_whitespace().next().unwrap_or(v).to_ascii_lowercase())
        .filter(|m| is_usable_mac(m))
}

// ── Windows ──────────────────────────────────────────────────────────────

/// Shells out to `reg`, `vol` and `getmac`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsProbe;

impl SignalProbe for WindowsProbe {
    fn machine_id(&self) -> Option<String> {
        let out = run(
            "reg",
            &[
                "query",
                r"HKLM\SOFTWARE\Microsoft\Cryptography",
                "/v",
                "MachineGuid",
            ],
        )?;
        parse_reg_machine_guid(&out)
    }

    fn usb_serial(&self) -> Option<String> {
        let exe = std::env::current_exe().ok()?;
        let exe = exe.to_str()?;
        let drive = exe.get(..2).filter(|d| d.ends_with(':'))?;
        let out = run("cmd", &["/C", "vol", drive])?;
        parse_vol_serial(&out)
    }

    fn network_mac(&self) -> Option<String> {
        let out = run("getmac", &["/fo", "csv", "/nh"])?;
        parse_getmac_csv(&out)
    }
}

fn parse_reg_machine_guid(out: &str) -> Option<String> {
    out.lines()
        .find(|l| l.contains("MachineGuid"))
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
}

fn parse_vol_serial(out: &str) -> Option<String> {
    out.lines()
        .find_map(|l| l.trim().strip_prefix("Volume Serial Number is "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_getmac_csv(out: &str) -> Option<String> {
    out.lines().find_map(|l| {
        let first = l.split(',').next()?.trim().trim_matches('"');
        let mac = first.replace('-', ":").to_ascii_lowercase();
        is_usable_mac(&mac).then_some(mac)
    })
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        tracing::debug!(program, "signal probe command failed");
        return None;
    }
    String::from_utf8(output.stdout).ok()
}
