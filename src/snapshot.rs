// src/snapshot.rs
// C3: Snapshot Controller — external qcow2 overlay snapshots, policy layer
// over the raw libvirt primitives exposed by `HypervisorGateway`.

use std::path::Path;

use tracing::{info, warn};

use crate::errors::{LpemError, Result};
use crate::guest_agent::GuestAgent;
use crate::hypervisor::{parse_all_disk_targets, DiskDescriptor, DomainHandle, HypervisorGateway};

/// One planned overlay: which base disk it shadows and where the overlay
/// file will live (spec §4.3 "Plan builder").
#[derive(Debug, Clone)]
pub struct SnapshotPlanEntry {
    pub target_dev: String,
    pub base_disk: DiskDescriptor,
    pub overlay_path: String,
}

/// Metadata describing an existing snapshot, as recovered from its own XML
/// (spec §4.3 "List").
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub name: String,
    pub creation_time: Option<String>,
    pub state: Option<String>,
    pub is_external: bool,
    pub has_memory: bool,
    pub description: Option<String>,
}

/// Overlay file name `<domain>-<target-dev>-<snapshot-name>.qcow2`, placed in
/// the base disk's own directory (spec §3, §6 "Snapshot file layout", §8
/// invariant 3). Never a separate directory.
pub fn overlay_path(base_disk_path: &str, domain: &str, target_dev: &str, snapshot_name: &str) -> String {
    let dir = Path::new(base_disk_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    format!("{dir}/{domain}-{target_dev}-{snapshot_name}.qcow2")
}

fn build_plan(
    domain: &str,
    snapshot_name: &str,
    disks: &[DiskDescriptor],
) -> Result<Vec<SnapshotPlanEntry>> {
    if disks.is_empty() {
        return Err(LpemError::SnapshotOperation(format!(
            "domain '{domain}' has no file-backed disks eligible for snapshotting"
        )));
    }

    let mut plan = Vec::with_capacity(disks.len());
    for disk in disks {
        let base_dir = Path::new(&disk.source_file).parent().ok_or_else(|| {
            LpemError::SnapshotOperation(format!(
                "base disk path '{}' has no parent directory",
                disk.source_file
            ))
        })?;
        if !base_dir.as_os_str().is_empty() && !base_dir.exists() {
            return Err(LpemError::SnapshotOperation(format!(
                "base disk directory '{}' does not exist",
                base_dir.display()
            )));
        }
        let path = overlay_path(&disk.source_file, domain, &disk.target_dev, snapshot_name);
        plan.push(SnapshotPlanEntry {
            target_dev: disk.target_dev.clone(),
            base_disk: disk.clone(),
            overlay_path: path,
        });
    }
    Ok(plan)
}

/// Writes the `<domainsnapshot>` XML libvirt needs for an external,
/// disk-only snapshot: eligible disks get `snapshot='external'` with their
/// computed overlay path, everything else is marked `snapshot='no'`
/// (string-template style, matching the teacher's `create_vm_xml`).
fn build_snapshot_xml(name: &str, plan: &[SnapshotPlanEntry], all_targets: &[(String, bool)]) -> String {
    let mut disks_xml = String::new();
    for (target, eligible) in all_targets {
        if *eligible {
            if let Some(entry) = plan.iter().find(|e| &e.target_dev == target) {
                disks_xml.push_str(&format!(
                    "    <disk name='{target}' snapshot='external'>\n      <driver type='qcow2'/>\n      <source file='{}'/>\n    </disk>\n",
                    entry.overlay_path
                ));
                continue;
            }
        }
        disks_xml.push_str(&format!("    <disk name='{target}' snapshot='no'/>\n"));
    }

    format!(
        r#"<domainsnapshot>
  <name>{name}</name>
  <disks>
{disks_xml}  </disks>
</domainsnapshot>"#
    )
}

/// Holds the gateway and guest-agent channel for one domain's worth of
/// snapshot operations; both are borrowed, not owned, so a single connection
/// pair can back many controller calls within one session (spec §5 "Shared
/// resources": one libvirt connection per session, never pooled across
/// domains).
pub struct SnapshotController<'a> {
    gateway: &'a dyn HypervisorGateway,
    agent: &'a dyn GuestAgent,
    thaw_warning: std::cell::RefCell<Option<String>>,
}

impl<'a> SnapshotController<'a> {
    pub fn new(gateway: &'a dyn HypervisorGateway, agent: &'a dyn GuestAgent) -> Self {
        SnapshotController {
            gateway,
            agent,
            thaw_warning: std::cell::RefCell::new(None),
        }
    }

    /// Takes (and clears) the loud warning recorded if `create`'s finalizer
    /// had to attempt a thaw and it failed (spec §7 "a failed thaw-after-
    /// freeze must surface as a loud, explicit warning regardless of
    /// overall outcome").
    pub fn take_thaw_warning(&self) -> Option<String> {
        self.thaw_warning.borrow_mut().take()
    }

    pub fn plan(&self, handle: &DomainHandle, snapshot_name: &str) -> Result<Vec<SnapshotPlanEntry>> {
        let disks = self.gateway.disk_inventory(handle)?;
        build_plan(&handle.name, snapshot_name, &disks)
    }

    /// Creates an external, disk-only, atomic snapshot. Freezes the guest
    /// filesystem first if the domain is active; a freeze failure just
    /// means QUIESCE is requested too (not a hard stop, spec §4.3). Thaw is
    /// always attempted in the finalizer when freeze reported success —
    /// the one hard failure this module recognizes is a failed thaw after a
    /// successful freeze (spec §4.2 policy, §8 invariant 2).
    pub fn create(&self, handle: &DomainHandle, snapshot_name: &str) -> Result<Vec<SnapshotPlanEntry>> {
        if self.gateway.snapshot_exists(handle, snapshot_name)? {
            return Err(LpemError::SnapshotOperation(format!(
                "snapshot '{snapshot_name}' already exists on '{}'",
                handle.name
            )));
        }

        let plan = self.plan(handle, snapshot_name)?;
        let domain_xml = self.gateway.describe(handle)?;
        let all_targets = parse_all_disk_targets(&domain_xml)?;
        let xml = build_snapshot_xml(snapshot_name, &plan, &all_targets);

        let active = self.gateway.is_active(handle)?;
        let mut froze = false;
        if active {
            froze = self.agent.fsfreeze(handle);
        }

        let create_result = self.gateway.snapshot_create_xml(handle, snapshot_name, &xml, !froze);

        if froze {
            let thawed = self.agent.fsthaw(handle);
            if !thawed {
                let msg = format!(
                    "fsthaw failed after a successful fsfreeze on '{}' (snapshot '{snapshot_name}'): guest filesystem may still be frozen",
                    handle.name
                );
                warn!("{msg}");
                *self.thaw_warning.borrow_mut() = Some(msg);
            }
        }

        create_result?;
        info!(domain = %handle.name, snapshot = snapshot_name, "snapshot created");
        Ok(plan)
    }

    /// Shuts the domain down fully (if active), then reverts with FORCE.
    /// The domain is expected to be inactive afterwards for a disk-only
    /// external snapshot; a running state is logged as a warning, not an
    /// error (spec §4.3 "Revert").
    pub fn revert(&self, handle: &DomainHandle, snapshot_name: &str, shutdown_deadline: std::time::Duration) -> Result<()> {
        if !self.gateway.snapshot_exists(handle, snapshot_name)? {
            return Err(LpemError::SnapshotOperation(format!(
                "snapshot '{snapshot_name}' not found on '{}'",
                handle.name
            )));
        }

        if self.gateway.is_active(handle)? {
            self.gateway.shutdown(handle, false, shutdown_deadline)?;
            if self.gateway.is_active(handle)? {
                self.gateway.shutdown(handle, true, shutdown_deadline)?;
            }
        }

        self.gateway.snapshot_revert(handle, snapshot_name, true)?;

        if self.gateway.is_active(handle).unwrap_or(false) {
            warn!(
                domain = %handle.name,
                snapshot = snapshot_name,
                "domain is running after revert; expected inactive for a disk-only external snapshot"
            );
        }
        Ok(())
    }

    /// Shuts the domain down if active, then merges the overlay back into
    /// the base image (flag 0 — block-commit, not metadata-only). A
    /// post-delete lookup that still finds the snapshot is a warning: the
    /// merge can complete asynchronously (spec §4.3 "Delete").
    pub fn delete(&self, handle: &DomainHandle, snapshot_name: &str, shutdown_deadline: std::time::Duration) -> Result<()> {
        if self.gateway.is_active(handle)? {
            self.gateway.shutdown(handle, false, shutdown_deadline)?;
        }
        self.gateway.snapshot_delete(handle, snapshot_name)?;

        if self.gateway.snapshot_exists(handle, snapshot_name).unwrap_or(false) {
            warn!(
                domain = %handle.name,
                snapshot = snapshot_name,
                "snapshot still visible immediately after delete; merge may still be in progress"
            );
        }
        Ok(())
    }

    /// Lists every snapshot on the domain, parsing each one's own XML for
    /// its recorded metadata. A snapshot that disappears mid-scan is
    /// reported as `Disappeared` rather than failing the whole list (spec
    /// §4.3 "List").
    pub fn list(&self, handle: &DomainHandle) -> Result<Vec<SnapshotListEntry>> {
        let names = self.gateway.snapshot_list_names(handle)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.gateway.snapshot_xml(handle, &name) {
                Ok(xml) => out.push(SnapshotListEntry::Present(parse_snapshot_info(&name, &xml))),
                Err(_) => out.push(SnapshotListEntry::Disappeared(name)),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub enum SnapshotListEntry {
    Present(SnapshotInfo),
    Disappeared(String),
}

fn parse_snapshot_info(name: &str, xml: &str) -> SnapshotInfo {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut creation_time = None;
    let mut state = None;
    let mut description = None;
    let mut is_external = false;
    let mut has_memory = false;
    let mut current_tag: Vec<u8> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let local = e.local_name().as_ref().to_vec();
                if local == b"disks" {
                    is_external = e
                        .attributes()
                        .flatten()
                        .any(|a| a.key.as_ref() == b"snapshot" && a.value.as_ref() == b"external");
                } else if local == b"memory" {
                    has_memory = e
                        .attributes()
                        .flatten()
                        .any(|a| a.key.as_ref() == b"snapshot");
                }
                current_tag = local;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                match current_tag.as_slice() {
                    b"creationTime" => creation_time = Some(text),
                    b"state" => state = Some(text),
                    b"description" => description = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    SnapshotInfo {
        name: name.to_string(),
        creation_time,
        state,
        is_external,
        has_memory,
        description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_agent::mock::MockGuestAgent;
    use crate::guest_agent::AgentReply;
    use crate::hypervisor::mock::{sample_domain_xml, MockDomain, MockGateway};
    use std::time::Duration;

    fn setup(domain: &str) -> (MockGateway, MockGuestAgent, tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let base_disk = dir.path().join("base.qcow2").to_string_lossy().into_owned();
        let gw = MockGateway::new();
        gw.add_domain(MockDomain {
            name: domain.to_string(),
            active: true,
            xml: sample_domain_xml(domain, "vda", &base_disk),
            memory_kb: 1024,
            max_memory_kb: 1024,
            vcpus: 1,
        });
        let agent = MockGuestAgent::new();
        agent.set_reply("guest-fsfreeze-freeze", Ok(AgentReply::Return(serde_json::json!(1))));
        agent.set_reply("guest-fsfreeze-thaw", Ok(AgentReply::Return(serde_json::json!(1))));
        (gw, agent, dir, base_disk)
    }

    #[test]
    fn overlay_name_matches_domain_target_snapshot_layout() {
        let path = overlay_path("/var/lib/lpem/images/base.qcow2", "vm1", "vda", "snap-a");
        assert_eq!(path, "/var/lib/lpem/images/vm1-vda-snap-a.qcow2");
    }

    #[test]
    fn create_then_list_then_delete_round_trips() {
        let (gw, agent, dir, base_disk) = setup("vm1");
        let handle = gw.lookup("vm1").unwrap();
        let controller = SnapshotController::new(&gw, &agent);

        let plan = controller.create(&handle, "snap-a").unwrap();
        assert_eq!(plan.len(), 1);
        let expected = overlay_path(&base_disk, "vm1", "vda", "snap-a");
        assert_eq!(plan[0].overlay_path, expected);
        assert_eq!(agent.call_count("guest-fsfreeze-freeze"), 1);
        assert_eq!(agent.call_count("guest-fsfreeze-thaw"), 1);

        let listed = controller.list(&handle).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(matches!(&listed[0], SnapshotListEntry::Present(info) if info.name == "snap-a"));

        controller
            .delete(&handle, "snap-a", Duration::from_secs(5))
            .unwrap();
        assert!(controller.list(&handle).unwrap().is_empty());
        drop(dir);
    }

    #[test]
    fn create_twice_with_same_name_is_rejected() {
        let (gw, agent, dir, _base_disk) = setup("vm1");
        let handle = gw.lookup("vm1").unwrap();
        let controller = SnapshotController::new(&gw, &agent);
        controller.create(&handle, "dup").unwrap();
        let err = controller.create(&handle, "dup").unwrap_err();
        assert!(matches!(err, LpemError::SnapshotOperation(_)));
        drop(dir);
    }

    #[test]
    fn revert_leaves_domain_inactive() {
        let (gw, agent, dir, _base_disk) = setup("vm1");
        let handle = gw.lookup("vm1").unwrap();
        let controller = SnapshotController::new(&gw, &agent);
        controller.create(&handle, "snap-a").unwrap();
        assert!(gw.is_active(&handle).unwrap());

        controller
            .revert(&handle, "snap-a", Duration::from_secs(5))
            .unwrap();
        assert!(!gw.is_active(&handle).unwrap());
        drop(dir);
    }

    #[test]
    fn plan_fails_when_domain_has_no_eligible_disks() {
        let gw = MockGateway::new();
        gw.add_domain(MockDomain {
            name: "vm-nodisk".to_string(),
            active: false,
            xml: "<domain type='kvm'><name>vm-nodisk</name><devices/></domain>".to_string(),
            memory_kb: 1024,
            max_memory_kb: 1024,
            vcpus: 1,
        });
        let agent = MockGuestAgent::new();
        let controller = SnapshotController::new(&gw, &agent);
        let handle = gw.lookup("vm-nodisk").unwrap();
        let err = controller.plan(&handle, "snap").unwrap_err();
        assert!(matches!(err, LpemError::SnapshotOperation(_)));
    }
}
