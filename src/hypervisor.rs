// src/hypervisor.rs
// C1: Hypervisor Gateway — a thin, typed wrapper over libvirt.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::errors::{LpemError, Result};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Runtime power state of a domain, mapped from libvirt's `VIR_DOMAIN_*`
/// constants (spec §3 disk/domain data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    Unknown,
}

/// Opaque reference to one libvirt domain (spec §3 "Domain handle").
///
/// A handle is only valid against the gateway connection that produced it;
/// `generation` lets every gateway method detect and refuse a handle minted
/// by a different (possibly already-closed) connection.
#[derive(Debug, Clone)]
pub struct DomainHandle {
    pub name: String,
    pub id: Option<u32>,
    pub(crate) generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DomainSummary {
    pub name: String,
    pub state: DomainState,
    pub id: Option<u32>,
    /// Best-effort IP; C1 never resolves this itself (that is C2/the engine's
    /// job) so it is always `None` from `list_domains` — the field exists to
    /// match the shape callers enrich.
    pub ip: Option<String>,
}

impl Default for DomainState {
    fn default() -> Self {
        DomainState::Unknown
    }
}

#[derive(Debug, Clone, Default)]
pub struct DomainInfo {
    pub memory_kb: u64,
    pub max_memory_kb: u64,
    pub vcpus: u32,
    pub state: DomainState,
}

/// Disk inventory entry parsed out of a domain's XML descriptor (spec §3).
#[derive(Debug, Clone)]
pub struct DiskDescriptor {
    pub target_dev: String,
    pub source_file: String,
    pub driver_format: String,
    pub device: DiskDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

/// Parameters for the minimal `create_domain` convenience (spec §4.1).
#[derive(Debug, Clone)]
pub struct NewDomainSpec {
    pub name: String,
    pub memory_gib: u32,
    pub vcpus: u32,
    pub disk_gib: u32,
    pub iso_path: Option<String>,
}

impl NewDomainSpec {
    pub fn validate(&self) -> Result<()> {
        if self.memory_gib < 1 {
            return Err(LpemError::Internal("memory_gib must be >= 1".into()));
        }
        if self.disk_gib < 1 {
            return Err(LpemError::Internal("disk_gib must be >= 1".into()));
        }
        if self.vcpus < 1 {
            return Err(LpemError::Internal("vcpus must be >= 1".into()));
        }
        Ok(())
    }
}

/// Thin, typed wrapper over libvirt: connect, lookup, list, lifecycle,
/// XML descriptor parse (spec §4.1).
pub trait HypervisorGateway: Send + Sync {
    fn list_domains(&self) -> Result<Vec<DomainSummary>>;
    fn lookup(&self, name: &str) -> Result<DomainHandle>;
    fn describe(&self, handle: &DomainHandle) -> Result<String>;
    fn info(&self, handle: &DomainHandle) -> Result<DomainInfo>;
    fn is_active(&self, handle: &DomainHandle) -> Result<bool>;
    fn start(&self, handle: &DomainHandle) -> Result<()>;
    fn shutdown(&self, handle: &DomainHandle, force: bool, deadline: Duration) -> Result<()>;
    fn create_domain(&self, spec: &NewDomainSpec) -> Result<DomainHandle>;
    fn delete_domain(&self, handle: &DomainHandle, remove_disk: bool) -> Result<()>;

    /// Raw libvirt external-disk-only snapshot creation (mechanism; policy —
    /// freeze/thaw, plan building, naming — lives in the snapshot controller).
    /// `quiesce` requests the QUIESCE flag on top of DISK_ONLY|ATOMIC.
    fn snapshot_create_xml(&self, handle: &DomainHandle, name: &str, xml: &str, quiesce: bool) -> Result<()>;
    fn snapshot_exists(&self, handle: &DomainHandle, name: &str) -> Result<bool>;
    fn snapshot_xml(&self, handle: &DomainHandle, name: &str) -> Result<String>;
    fn snapshot_list_names(&self, handle: &DomainHandle) -> Result<Vec<String>>;
    fn snapshot_revert(&self, handle: &DomainHandle, name: &str, force: bool) -> Result<()>;
    fn snapshot_delete(&self, handle: &DomainHandle, name: &str) -> Result<()>;

    /// Disk inventory used by the snapshot controller (parsed from `describe`).
    fn disk_inventory(&self, handle: &DomainHandle) -> Result<Vec<DiskDescriptor>> {
        let xml = self.describe(handle)?;
        parse_disk_inventory(&xml)
    }

    /// Preferred IP resolution strategy (spec §4.5 "IP resolution"):
    /// libvirt's agent-backed `virDomainInterfaceAddresses`, which asks the
    /// guest agent for its view of every interface in one call without going
    /// through the raw JSON-RPC channel itself. Returns IPv4 addresses only,
    /// in whatever order libvirt reports the interfaces. The base gateway has
    /// no connection to ask; `LibvirtGateway` overrides this with the real
    /// lookup.
    fn agent_interface_ipv4s(&self, _handle: &DomainHandle) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Best-effort DHCP-lease IP lookup, used as the last-resort IP
    /// resolution strategy when neither the agent-backed interface lookup
    /// nor the `guest-network-get-interfaces` fallback (C2) yields anything
    /// (spec §4.5 "IP resolution"). The base gateway has no network to
    /// consult; `LibvirtGateway` overrides this with the real lookup.
    fn dhcp_lease_ip(&self, _handle: &DomainHandle) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, serde::Deserialize)]
struct DomainXml {
    #[serde(default)]
    devices: DomainDevicesXml,
}

#[derive(Debug, Default, serde::Deserialize)]
struct DomainDevicesXml {
    #[serde(rename = "disk", default)]
    disks: Vec<DiskXml>,
}

#[derive(Debug, serde::Deserialize)]
struct DiskXml {
    #[serde(rename = "@type", default)]
    kind: Option<String>,
    #[serde(rename = "@device", default)]
    device: Option<String>,
    #[serde(default)]
    source: Option<DiskSourceXml>,
    #[serde(default)]
    target: Option<DiskTargetXml>,
    #[serde(default)]
    driver: Option<DiskDriverXml>,
}

#[derive(Debug, serde::Deserialize)]
struct DiskSourceXml {
    #[serde(rename = "@file", default)]
    file: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct DiskTargetXml {
    #[serde(rename = "@dev", default)]
    dev: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct DiskDriverXml {
    #[serde(rename = "@type", default)]
    kind: Option<String>,
}

/// Parses `devices/disk` entries out of a domain XML descriptor via
/// `quick_xml::de`, keeping only `type='file'` entries with both a
/// `source/@file` and a `target/@dev` (spec §4.3 plan-builder step 2).
/// Entries missing either are skipped, not treated as errors.
pub fn parse_disk_inventory(xml: &str) -> Result<Vec<DiskDescriptor>> {
    let parsed: DomainXml = quick_xml::de::from_str(xml)
        .map_err(|e| LpemError::SnapshotOperation(format!("failed to parse domain XML: {e}")))?;

    let mut disks = Vec::new();
    for disk in parsed.devices.disks {
        let is_file = disk.kind.as_deref() == Some("file");
        let device = match disk.device.as_deref() {
            Some("cdrom") => DiskDevice::Cdrom,
            _ => DiskDevice::Disk,
        };
        if !is_file || device != DiskDevice::Disk {
            continue;
        }
        let source_file = disk.source.and_then(|s| s.file);
        let target_dev = disk.target.and_then(|t| t.dev);
        let driver_format = disk
            .driver
            .and_then(|d| d.kind)
            .unwrap_or_else(|| "qcow2".to_string());
        if let (Some(source_file), Some(target_dev)) = (source_file, target_dev) {
            disks.push(DiskDescriptor {
                target_dev,
                source_file,
                driver_format,
                device,
            });
        }
    }
    Ok(disks)
}

/// Every `target/@dev` in the domain along with whether it is eligible for
/// external snapshotting (`type=file device=disk`) — used by the snapshot
/// XML writer to mark ineligible devices (cdroms, block disks) `snapshot='no'`
/// so libvirt doesn't try to snapshot them.
pub fn parse_all_disk_targets(xml: &str) -> Result<Vec<(String, bool)>> {
    let parsed: DomainXml = quick_xml::de::from_str(xml)
        .map_err(|e| LpemError::SnapshotOperation(format!("failed to parse domain XML: {e}")))?;

    let mut out = Vec::new();
    for disk in parsed.devices.disks {
        let Some(target_dev) = disk.target.and_then(|t| t.dev) else {
            continue;
        };
        let is_file = disk.kind.as_deref() == Some("file");
        let is_disk = !matches!(disk.device.as_deref(), Some("cdrom"));
        out.push((target_dev, is_file && is_disk));
    }
    Ok(out)
}

/// Deterministic, locally-administered MAC derived from a domain name
/// (matches the original tool's `52:54:00:xx:xx:xx` scheme, spec §4.1).
pub fn mac_for_name(name: &str) -> String {
    let digest = md5_like(name.as_bytes());
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2]
    )
}

/// A small, dependency-free 3-byte digest good enough for MAC-suffix
/// derivation. Not cryptographic; only uniqueness-per-name is required here.
fn md5_like(bytes: &[u8]) -> [u8; 3] {
    let mut h: u32 = 0x9e3779b9;
    for &b in bytes {
        h = h.wrapping_mul(16777619) ^ (b as u32);
    }
    [(h & 0xff) as u8, ((h >> 8) & 0xff) as u8, ((h >> 16) & 0xff) as u8]
}

pub fn domain_create_xml(
    name: &str,
    vcpus: u32,
    memory_mb: u64,
    disk_path: &str,
    disk_format: &str,
    iso_path: Option<&str>,
) -> String {
    let memory_kb = memory_mb * 1024;
    let mac = mac_for_name(name);
    let cdrom_xml = iso_path
        .map(|iso| {
            format!(
                r#"<disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{iso}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>"#
            )
        })
        .unwrap_or_default();
    let boot_cdrom = if iso_path.is_some() {
        "<boot dev='cdrom'/>"
    } else {
        ""
    };

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kb}</memory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
    {boot_cdrom}
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='{disk_format}'/>
      <source file='{disk_path}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    {cdrom_xml}
    <interface type='network'>
      <mac address='{mac}'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <rng model='virtio'>
      <backend model='random'>/dev/urandom</backend>
    </rng>
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
  </devices>
</domain>"#
    )
}

#[cfg(feature = "libvirt_integration")]
mod libvirt_impl {
    use super::*;
    use virt::connect::Connect;
    use virt::domain::Domain;
    use virt::sys;

    pub struct LibvirtGateway {
        conn: Connect,
        generation: u64,
        image_dir: String,
    }

    impl LibvirtGateway {
        pub fn open(uri: &str, image_dir: &str) -> Result<Self> {
            let conn = Connect::open(Some(uri)).map_err(|e| LpemError::LibvirtConnection {
                uri: uri.to_string(),
                source: anyhow::anyhow!(e.to_string()),
            })?;
            let generation = NEXT_GENERATION.fetch_add(1, Ordering::SeqCst);
            info!(uri, generation, "opened libvirt connection");
            std::fs::create_dir_all(image_dir).ok();
            Ok(LibvirtGateway {
                conn,
                generation,
                image_dir: image_dir.to_string(),
            })
        }

        fn check_generation(&self, handle: &DomainHandle) -> Result<()> {
            if handle.generation != self.generation {
                return Err(LpemError::Internal(format!(
                    "stale domain handle for '{}': issued by a different/closed gateway connection",
                    handle.name
                )));
            }
            Ok(())
        }

        fn resolve(&self, handle: &DomainHandle) -> Result<Domain> {
            self.check_generation(handle)?;
            Domain::lookup_by_name(&self.conn, &handle.name).map_err(|_| {
                LpemError::VmNotFound(handle.name.clone())
            })
        }

        fn map_state(code: u32) -> DomainState {
            match code {
                sys::VIR_DOMAIN_NOSTATE => DomainState::NoState,
                sys::VIR_DOMAIN_RUNNING => DomainState::Running,
                sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
                sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
                sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
                sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
                sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
                sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
                _ => DomainState::Unknown,
            }
        }
    }

    impl Drop for LibvirtGateway {
        fn drop(&mut self) {
            if let Err(e) = self.conn.close() {
                warn!("error closing libvirt connection: {e}");
            }
        }
    }

    impl HypervisorGateway for LibvirtGateway {
        fn list_domains(&self) -> Result<Vec<DomainSummary>> {
            let mut names = Vec::new();
            if let Ok(active_ids) = self.conn.list_domains() {
                for id in active_ids {
                    if let Ok(d) = Domain::lookup_by_id(&self.conn, id) {
                        if let Ok(n) = d.get_name() {
                            names.push(n);
                        }
                    }
                }
            }
            if let Ok(defined) = self.conn.list_defined_domains() {
                names.extend(defined);
            }
            names.sort_unstable();
            names.dedup();

            let mut out = Vec::with_capacity(names.len());
            for name in names {
                if let Ok(d) = Domain::lookup_by_name(&self.conn, &name) {
                    let state = d
                        .get_info()
                        .map(|info| Self::map_state(info.state))
                        .unwrap_or(DomainState::Unknown);
                    let id = d.get_id();
                    out.push(DomainSummary {
                        name,
                        state,
                        id,
                        ip: None,
                    });
                }
            }
            Ok(out)
        }

        fn lookup(&self, name: &str) -> Result<DomainHandle> {
            let domain = Domain::lookup_by_name(&self.conn, name)
                .map_err(|_| LpemError::VmNotFound(name.to_string()))?;
            Ok(DomainHandle {
                name: name.to_string(),
                id: domain.get_id(),
                generation: self.generation,
            })
        }

        fn describe(&self, handle: &DomainHandle) -> Result<String> {
            let domain = self.resolve(handle)?;
            domain
                .get_xml_desc(0)
                .map_err(|e| LpemError::Internal(format!("get_xml_desc failed: {e}")))
        }

        fn info(&self, handle: &DomainHandle) -> Result<DomainInfo> {
            let domain = self.resolve(handle)?;
            let info = domain
                .get_info()
                .map_err(|e| LpemError::Internal(format!("get_info failed: {e}")))?;
            Ok(DomainInfo {
                memory_kb: info.memory,
                max_memory_kb: info.max_mem,
                vcpus: info.nr_virt_cpu,
                state: Self::map_state(info.state),
            })
        }

        fn is_active(&self, handle: &DomainHandle) -> Result<bool> {
            let domain = self.resolve(handle)?;
            domain
                .is_active()
                .map_err(|e| LpemError::Internal(format!("is_active failed: {e}")))
        }

        fn start(&self, handle: &DomainHandle) -> Result<()> {
            let domain = self.resolve(handle)?;
            if domain.is_active().unwrap_or(false) {
                debug!(name = %handle.name, "start is a no-op: domain already active");
                return Ok(());
            }
            domain
                .create()
                .map_err(|e| LpemError::Internal(format!("failed to start domain: {e}")))?;
            Ok(())
        }

        fn shutdown(&self, handle: &DomainHandle, force: bool, deadline: Duration) -> Result<()> {
            let domain = match self.resolve(handle) {
                Ok(d) => d,
                Err(LpemError::VmNotFound(_)) => return Ok(()), // vanished: success
                Err(e) => return Err(e),
            };

            if !domain.is_active().unwrap_or(false) {
                return Ok(());
            }

            if force {
                domain
                    .destroy()
                    .map_err(|e| LpemError::Internal(format!("destroy failed: {e}")))?;
                return Ok(());
            }

            domain
                .shutdown()
                .map_err(|e| LpemError::Internal(format!("shutdown request failed: {e}")))?;

            let start = Instant::now();
            loop {
                match domain.is_active() {
                    Ok(false) => return Ok(()),
                    Ok(true) => {}
                    Err(_) => return Ok(()), // vanished mid-poll: success
                }
                if start.elapsed() >= deadline {
                    warn!(name = %handle.name, "graceful shutdown deadline exceeded, escalating to destroy");
                    domain
                        .destroy()
                        .map_err(|e| LpemError::Internal(format!("destroy escalation failed: {e}")))?;
                    return Ok(());
                }
                thread::sleep(Duration::from_secs(2));
            }
        }

        fn create_domain(&self, spec: &NewDomainSpec) -> Result<DomainHandle> {
            spec.validate()?;
            if Domain::lookup_by_name(&self.conn, &spec.name).is_ok() {
                return Err(LpemError::Internal(format!(
                    "domain '{}' already exists",
                    spec.name
                )));
            }

            let disk_path = format!("{}/{}.qcow2", self.image_dir.trim_end_matches('/'), spec.name);
            let status = std::process::Command::new("qemu-img")
                .args(["create", "-f", "qcow2", &disk_path, &format!("{}G", spec.disk_gib)])
                .output()
                .map_err(|e| LpemError::Internal(format!("failed to spawn qemu-img: {e}")))?;
            if !status.status.success() {
                return Err(LpemError::Internal(format!(
                    "qemu-img create failed: {}",
                    String::from_utf8_lossy(&status.stderr)
                )));
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = std::fs::metadata(&disk_path) {
                    let mut perms = meta.permissions();
                    perms.set_mode(0o644);
                    let _ = std::fs::set_permissions(&disk_path, perms);
                }
            }

            let xml = domain_create_xml(
                &spec.name,
                spec.vcpus,
                (spec.memory_gib as u64) * 1024,
                &disk_path,
                "qcow2",
                spec.iso_path.as_deref(),
            );

            match self.conn.define_xml(&xml) {
                Ok(domain) => Ok(DomainHandle {
                    name: spec.name.clone(),
                    id: domain.get_id(),
                    generation: self.generation,
                }),
                Err(e) => {
                    let _ = std::fs::remove_file(&disk_path);
                    Err(LpemError::Internal(format!("failed to define domain: {e}")))
                }
            }
        }

        fn delete_domain(&self, handle: &DomainHandle, remove_disk: bool) -> Result<()> {
            let domain = self.resolve(handle)?;
            let disk_path = if remove_disk {
                self.describe(handle)
                    .ok()
                    .and_then(|xml| parse_disk_inventory(&xml).ok())
                    .and_then(|disks| disks.into_iter().find(|d| d.device == DiskDevice::Disk))
                    .map(|d| d.source_file)
            } else {
                None
            };

            if domain.is_active().unwrap_or(false) {
                domain
                    .destroy()
                    .map_err(|e| LpemError::Internal(format!("destroy before delete failed: {e}")))?;
            }
            domain
                .undefine()
                .map_err(|e| LpemError::Internal(format!("undefine failed: {e}")))?;

            if let Some(path) = disk_path {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("could not remove disk file {path}: {e}");
                }
            }
            Ok(())
        }

        fn snapshot_create_xml(&self, handle: &DomainHandle, name: &str, xml: &str, quiesce: bool) -> Result<()> {
            let domain = self.resolve(handle)?;
            if domain.snapshot_lookup_by_name(name, 0).is_ok() {
                return Err(LpemError::SnapshotOperation(format!(
                    "snapshot '{name}' already exists on '{}'",
                    handle.name
                )));
            }
            let mut flags =
                sys::VIR_DOMAIN_SNAPSHOT_CREATE_DISK_ONLY | sys::VIR_DOMAIN_SNAPSHOT_CREATE_ATOMIC;
            if quiesce {
                flags |= sys::VIR_DOMAIN_SNAPSHOT_CREATE_QUIESCE;
            }
            domain
                .snapshot_create_xml(xml, flags)
                .map_err(|e| LpemError::SnapshotOperation(format!("snapshot create failed: {e}")))?;
            Ok(())
        }

        fn snapshot_exists(&self, handle: &DomainHandle, name: &str) -> Result<bool> {
            let domain = self.resolve(handle)?;
            Ok(domain.snapshot_lookup_by_name(name, 0).is_ok())
        }

        fn snapshot_xml(&self, handle: &DomainHandle, name: &str) -> Result<String> {
            let domain = self.resolve(handle)?;
            let snap = domain
                .snapshot_lookup_by_name(name, 0)
                .map_err(|_| LpemError::SnapshotOperation(format!("snapshot '{name}' not found")))?;
            snap.get_xml_desc(0)
                .map_err(|e| LpemError::SnapshotOperation(format!("failed to read snapshot XML: {e}")))
        }

        fn snapshot_list_names(&self, handle: &DomainHandle) -> Result<Vec<String>> {
            let domain = self.resolve(handle)?;
            domain
                .snapshot_list_names(0)
                .map_err(|e| LpemError::SnapshotOperation(format!("failed to list snapshots: {e}")))
        }

        fn snapshot_revert(&self, handle: &DomainHandle, name: &str, force: bool) -> Result<()> {
            let domain = self.resolve(handle)?;
            let snap = domain
                .snapshot_lookup_by_name(name, 0)
                .map_err(|_| LpemError::SnapshotOperation(format!("snapshot '{name}' not found")))?;
            let flags = if force {
                sys::VIR_DOMAIN_SNAPSHOT_REVERT_FORCE
            } else {
                0
            };
            snap.revert(flags)
                .map_err(|e| LpemError::SnapshotOperation(format!("snapshot revert failed: {e}")))?;
            Ok(())
        }

        fn snapshot_delete(&self, handle: &DomainHandle, name: &str) -> Result<()> {
            let domain = self.resolve(handle)?;
            let snap = domain
                .snapshot_lookup_by_name(name, 0)
                .map_err(|_| LpemError::SnapshotOperation(format!("snapshot '{name}' not found")))?;
            snap.delete(0)
                .map_err(|e| LpemError::SnapshotOperation(format!("snapshot delete failed: {e}")))?;
            Ok(())
        }

        fn agent_interface_ipv4s(&self, handle: &DomainHandle) -> Result<Vec<String>> {
            let domain = self.resolve(handle)?;
            let interfaces = match domain.interface_addresses(
                sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT,
                0,
            ) {
                Ok(ifaces) => ifaces,
                // Agent not reachable yet (boot, no agent installed): not an
                // error, just nothing to report (spec §4.2 policy).
                Err(_) => return Ok(Vec::new()),
            };

            let mut ips = Vec::new();
            for iface in interfaces {
                if iface.name == "lo" {
                    continue;
                }
                for addr in iface.addrs {
                    if addr.typed == sys::VIR_IP_ADDR_TYPE_IPV4 && !is_link_local_or_loopback(&addr.addr) {
                        ips.push(addr.addr);
                    }
                }
            }
            Ok(ips)
        }

        fn dhcp_lease_ip(&self, handle: &DomainHandle) -> Result<Option<String>> {
            use virt::network::Network;

            let xml = self.describe(handle)?;
            let Some((network_name, mac)) = parse_first_network_interface(&xml) else {
                return Ok(None);
            };
            let network = match Network::lookup_by_name(&self.conn, &network_name) {
                Ok(n) => n,
                Err(_) => return Ok(None),
            };
            let leases = network
                .get_dhcp_leases()
                .map_err(|e| LpemError::Network(format!("failed to read DHCP leases: {e}")))?;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let ip = leases
                .into_iter()
                .find(|lease| {
                    lease.mac.as_deref() == Some(mac.as_str())
                        && (lease.expirytime == 0 || lease.expirytime as i64 > now)
                })
                .and_then(|lease| lease.ipaddr)
                .filter(|ip| !is_link_local_or_loopback(ip));
            Ok(ip)
        }
    }
}

/// Extracts the `source/@network` and `mac/@address` of the first
/// `interface type='network'` element, used for the DHCP-lease IP fallback
/// (spec §4.5 "IP resolution").
fn parse_first_network_interface(xml: &str) -> Option<(String, String)> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_iface = false;
    let mut is_network_type = false;
    let mut network_name: Option<String> = None;
    let mut mac: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"interface" => {
                        in_iface = true;
                        is_network_type = e
                            .attributes()
                            .flatten()
                            .any(|a| a.key.as_ref() == b"type" && a.value.as_ref() == b"network");
                    }
                    b"source" if in_iface && is_network_type => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"network" {
                                network_name = Some(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                    }
                    b"mac" if in_iface && is_network_type => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"address" {
                                mac = Some(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"interface" => {
                if is_network_type && network_name.is_some() && mac.is_some() {
                    return Some((network_name.unwrap(), mac.unwrap()));
                }
                in_iface = false;
                is_network_type = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    None
}

fn is_link_local_or_loopback(ip: &str) -> bool {
    ip.starts_with("169.254.") || ip.starts_with("127.")
}

#[cfg(feature = "libvirt_integration")]
pub use libvirt_impl::LibvirtGateway;

/// In-memory fake used by tests and by the Design Notes' "library-shaped
/// mocks" guidance — substitutes for a real libvirt connection.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub struct MockDomain {
        pub name: String,
        pub active: bool,
        pub xml: String,
        pub memory_kb: u64,
        pub max_memory_kb: u64,
        pub vcpus: u32,
    }

    pub struct MockGateway {
        generation: u64,
        domains: RefCell<HashMap<String, MockDomain>>,
        pub shutdown_hangs: RefCell<bool>,
        snapshots: RefCell<HashMap<String, HashMap<String, String>>>,
        pub dhcp_lease: RefCell<Option<String>>,
        pub agent_ips: RefCell<Vec<String>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            MockGateway {
                generation: NEXT_GENERATION.fetch_add(1, Ordering::SeqCst),
                domains: RefCell::new(HashMap::new()),
                shutdown_hangs: RefCell::new(false),
                snapshots: RefCell::new(HashMap::new()),
                dhcp_lease: RefCell::new(None),
                agent_ips: RefCell::new(Vec::new()),
            }
        }

        pub fn add_domain(&self, domain: MockDomain) {
            self.domains.borrow_mut().insert(domain.name.clone(), domain);
        }

        pub fn generation(&self) -> u64 {
            self.generation
        }

        fn check_generation(&self, handle: &DomainHandle) -> Result<()> {
            if handle.generation != self.generation {
                return Err(LpemError::Internal(format!(
                    "stale domain handle for '{}'",
                    handle.name
                )));
            }
            Ok(())
        }
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HypervisorGateway for MockGateway {
        fn list_domains(&self) -> Result<Vec<DomainSummary>> {
            Ok(self
                .domains
                .borrow()
                .values()
                .map(|d| DomainSummary {
                    name: d.name.clone(),
                    state: if d.active {
                        DomainState::Running
                    } else {
                        DomainState::Shutoff
                    },
                    id: None,
                    ip: None,
                })
                .collect())
        }

        fn lookup(&self, name: &str) -> Result<DomainHandle> {
            if self.domains.borrow().contains_key(name) {
                Ok(DomainHandle {
                    name: name.to_string(),
                    id: None,
                    generation: self.generation,
                })
            } else {
                Err(LpemError::VmNotFound(name.to_string()))
            }
        }

        fn describe(&self, handle: &DomainHandle) -> Result<String> {
            self.check_generation(handle)?;
            self.domains
                .borrow()
                .get(&handle.name)
                .map(|d| d.xml.clone())
                .ok_or_else(|| LpemError::VmNotFound(handle.name.clone()))
        }

        fn info(&self, handle: &DomainHandle) -> Result<DomainInfo> {
            self.check_generation(handle)?;
            let domains = self.domains.borrow();
            let d = domains
                .get(&handle.name)
                .ok_or_else(|| LpemError::VmNotFound(handle.name.clone()))?;
            Ok(DomainInfo {
                memory_kb: d.memory_kb,
                max_memory_kb: d.max_memory_kb,
                vcpus: d.vcpus,
                state: if d.active {
                    DomainState::Running
                } else {
                    DomainState::Shutoff
                },
            })
        }

        fn is_active(&self, handle: &DomainHandle) -> Result<bool> {
            self.check_generation(handle)?;
            Ok(self
                .domains
                .borrow()
                .get(&handle.name)
                .map(|d| d.active)
                .unwrap_or(false))
        }

        fn start(&self, handle: &DomainHandle) -> Result<()> {
            self.check_generation(handle)?;
            let mut domains = self.domains.borrow_mut();
            let d = domains
                .get_mut(&handle.name)
                .ok_or_else(|| LpemError::VmNotFound(handle.name.clone()))?;
            d.active = true;
            Ok(())
        }

        fn shutdown(&self, handle: &DomainHandle, force: bool, deadline: Duration) -> Result<()> {
            self.check_generation(handle)?;
            if *self.shutdown_hangs.borrow() && !force {
                // Simulate an unresponsive guest: poll past the deadline,
                // exactly like the real gateway, then escalate to destroy.
                thread::sleep(deadline + Duration::from_millis(10));
            }
            let mut domains = self.domains.borrow_mut();
            if let Some(d) = domains.get_mut(&handle.name) {
                d.active = false;
            }
            Ok(())
        }

        fn create_domain(&self, spec: &NewDomainSpec) -> Result<DomainHandle> {
            spec.validate()?;
            if self.domains.borrow().contains_key(&spec.name) {
                return Err(LpemError::Internal(format!(
                    "domain '{}' already exists",
                    spec.name
                )));
            }
            let xml = domain_create_xml(
                &spec.name,
                spec.vcpus,
                (spec.memory_gib as u64) * 1024,
                &format!("/tmp/{}.qcow2", spec.name),
                "qcow2",
                spec.iso_path.as_deref(),
            );
            self.add_domain(MockDomain {
                name: spec.name.clone(),
                active: false,
                xml,
                memory_kb: (spec.memory_gib as u64) * 1024 * 1024,
                max_memory_kb: (spec.memory_gib as u64) * 1024 * 1024,
                vcpus: spec.vcpus,
            });
            Ok(DomainHandle {
                name: spec.name.clone(),
                id: None,
                generation: self.generation,
            })
        }

        fn delete_domain(&self, handle: &DomainHandle, _remove_disk: bool) -> Result<()> {
            self.check_generation(handle)?;
            self.domains
                .borrow_mut()
                .remove(&handle.name)
                .map(|_| ())
                .ok_or_else(|| LpemError::VmNotFound(handle.name.clone()))
        }

        fn snapshot_create_xml(&self, handle: &DomainHandle, name: &str, xml: &str, _quiesce: bool) -> Result<()> {
            self.check_generation(handle)?;
            let mut snaps = self.snapshots.borrow_mut();
            let domain_snaps = snaps.entry(handle.name.clone()).or_default();
            if domain_snaps.contains_key(name) {
                return Err(LpemError::SnapshotOperation(format!(
                    "snapshot '{name}' already exists on '{}'",
                    handle.name
                )));
            }
            domain_snaps.insert(name.to_string(), xml.to_string());
            Ok(())
        }

        fn snapshot_exists(&self, handle: &DomainHandle, name: &str) -> Result<bool> {
            self.check_generation(handle)?;
            Ok(self
                .snapshots
                .borrow()
                .get(&handle.name)
                .map(|m| m.contains_key(name))
                .unwrap_or(false))
        }

        fn snapshot_xml(&self, handle: &DomainHandle, name: &str) -> Result<String> {
            self.check_generation(handle)?;
            self.snapshots
                .borrow()
                .get(&handle.name)
                .and_then(|m| m.get(name).cloned())
                .ok_or_else(|| LpemError::SnapshotOperation(format!("snapshot '{name}' not found")))
        }

        fn snapshot_list_names(&self, handle: &DomainHandle) -> Result<Vec<String>> {
            self.check_generation(handle)?;
            Ok(self
                .snapshots
                .borrow()
                .get(&handle.name)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default())
        }

        fn snapshot_revert(&self, handle: &DomainHandle, name: &str, _force: bool) -> Result<()> {
            self.check_generation(handle)?;
            if !self.snapshot_exists(handle, name)? {
                return Err(LpemError::SnapshotOperation(format!("snapshot '{name}' not found")));
            }
            let mut domains = self.domains.borrow_mut();
            if let Some(d) = domains.get_mut(&handle.name) {
                d.active = false;
            }
            Ok(())
        }

        fn snapshot_delete(&self, handle: &DomainHandle, name: &str) -> Result<()> {
            self.check_generation(handle)?;
            let mut snaps = self.snapshots.borrow_mut();
            let removed = snaps
                .get_mut(&handle.name)
                .and_then(|m| m.remove(name))
                .is_some();
            if removed {
                Ok(())
            } else {
                Err(LpemError::SnapshotOperation(format!("snapshot '{name}' not found")))
            }
        }

        fn agent_interface_ipv4s(&self, handle: &DomainHandle) -> Result<Vec<String>> {
            self.check_generation(handle)?;
            Ok(self.agent_ips.borrow().clone())
        }

        fn dhcp_lease_ip(&self, handle: &DomainHandle) -> Result<Option<String>> {
            self.check_generation(handle)?;
            Ok(self.dhcp_lease.borrow().clone())
        }
    }

    pub fn sample_domain_xml(name: &str, target: &str, disk_path: &str) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk_path}'/>
      <target dev='{target}' bus='virtio'/>
    </disk>
  </devices>
</domain>"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn start_on_running_domain_is_noop() {
        let gw = MockGateway::new();
        gw.add_domain(MockDomain {
            name: "vm1".into(),
            active: true,
            xml: sample_domain_xml("vm1", "vda", "/tmp/vm1.qcow2"),
            memory_kb: 1024,
            max_memory_kb: 1024,
            vcpus: 1,
        });
        let handle = gw.lookup("vm1").unwrap();
        gw.start(&handle).unwrap();
        assert!(gw.is_active(&handle).unwrap());
    }

    #[test]
    fn shutdown_on_stopped_domain_is_success_without_destroy() {
        let gw = MockGateway::new();
        gw.add_domain(MockDomain {
            name: "vm1".into(),
            active: false,
            xml: sample_domain_xml("vm1", "vda", "/tmp/vm1.qcow2"),
            memory_kb: 1024,
            max_memory_kb: 1024,
            vcpus: 1,
        });
        let handle = gw.lookup("vm1").unwrap();
        gw.shutdown(&handle, false, Duration::from_secs(1)).unwrap();
        assert!(!gw.is_active(&handle).unwrap());
    }

    #[test]
    fn stale_handle_from_other_gateway_is_refused() {
        let gw_a = MockGateway::new();
        gw_a.add_domain(MockDomain {
            name: "vm1".into(),
            active: false,
            xml: sample_domain_xml("vm1", "vda", "/tmp/vm1.qcow2"),
            memory_kb: 1024,
            max_memory_kb: 1024,
            vcpus: 1,
        });
        let handle = gw_a.lookup("vm1").unwrap();

        let gw_b = MockGateway::new();
        gw_b.add_domain(MockDomain {
            name: "vm1".into(),
            active: false,
            xml: sample_domain_xml("vm1", "vda", "/tmp/vm1.qcow2"),
            memory_kb: 1024,
            max_memory_kb: 1024,
            vcpus: 1,
        });
        let err = gw_b.info(&handle).unwrap_err();
        assert!(matches!(err, LpemError::Internal(_)));
    }

    #[test]
    fn disk_inventory_skips_cdrom_and_block_devices() {
        let xml = r#"<domain type='kvm'>
  <name>vm1</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/images/vm1.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/isos/install.iso'/>
      <target dev='sda' bus='sata'/>
    </disk>
    <disk type='block' device='disk'>
      <source dev='/dev/sdb'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
  </devices>
</domain>"#;
        let disks = parse_disk_inventory(xml).unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].target_dev, "vda");
        assert_eq!(disks[0].source_file, "/images/vm1.qcow2");
    }

    #[test]
    fn mac_for_name_is_deterministic() {
        assert_eq!(mac_for_name("practice-vm"), mac_for_name("practice-vm"));
        assert_ne!(mac_for_name("practice-vm"), mac_for_name("other-vm"));
        assert!(mac_for_name("practice-vm").starts_with("52:54:00:"));
    }
}
