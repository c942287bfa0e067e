// src/engine.rs
// C5 behavior: the challenge session algorithm, the user-done signal
// channel, and the five step validators.

use std::sync::mpsc;
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::challenge::{ChallengeDescriptor, FileType, PortProtocol, ServiceStatus, SetupStep, ValidationStep};
use crate::errors::{LpemError, Result};
use crate::guest_agent::GuestAgent;
use crate::hypervisor::{DomainHandle, HypervisorGateway};
use crate::snapshot::SnapshotController;
use crate::ssh::{ExecOptions, ExitStatus, SshClient};

/// The one external signal `run_challenge` waits on when not simulating the
/// user (spec §6 "User-done signal"): a single call into the engine that
/// unblocks the session, or a cancellation that still runs the finally
/// block (spec §5 "Cancellation and timeouts").
pub enum UserSignal {
    Done,
    Cancelled,
}

#[derive(Clone)]
pub struct UserDoneHandle {
    tx: mpsc::Sender<UserSignal>,
}

impl UserDoneHandle {
    pub fn signal_done(&self) {
        let _ = self.tx.send(UserSignal::Done);
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(UserSignal::Cancelled);
    }
}

pub fn user_done_channel() -> (UserDoneHandle, mpsc::Receiver<UserSignal>) {
    let (tx, rx) = mpsc::channel();
    (UserDoneHandle { tx }, rx)
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub index: usize,
    pub passed: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub all_ok: bool,
    pub score: i64,
    pub per_step: Vec<StepRecord>,
    pub flag: Option<String>,
    pub aborted: bool,
    pub cleanup_issues: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct EngineConfig {
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Longer timeout for `setup` steps (spec §6 "30s per-command, 120s for
    /// package-management operations") — setup commonly installs packages,
    /// validation checks do not.
    pub package_command_timeout: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub shutdown_deadline: Duration,
    pub snapshot_prefix: String,
    pub keep_snapshot: bool,
}

/// RAII guard around one snapshot's create→revert→delete lifetime. Dropping
/// it (on any exit path — success, early `?`, or cancellation) runs the
/// finally-block: revert, then delete unless `keep` was requested, attempting
/// both even if one fails and collecting failures rather than masking the
/// caller's own error (spec §7 "Finalizers always run").
struct SnapshotGuard<'a, 'b> {
    controller: &'b SnapshotController<'a>,
    handle: DomainHandle,
    name: String,
    shutdown_deadline: Duration,
    keep: bool,
    armed: bool,
    issues: Vec<String>,
}

impl<'a, 'b> SnapshotGuard<'a, 'b> {
    fn new(controller: &'b SnapshotController<'a>, handle: DomainHandle, name: String, shutdown_deadline: Duration, keep: bool) -> Self {
        SnapshotGuard {
            controller,
            handle,
            name,
            shutdown_deadline,
            keep,
            armed: false,
            issues: Vec::new(),
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn finish(mut self) -> Vec<String> {
        self.run_cleanup();
        std::mem::take(&mut self.issues)
    }

    fn run_cleanup(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = self
            .controller
            .revert(&self.handle, &self.name, self.shutdown_deadline)
        {
            self.issues.push(format!("revert failed: {e}"));
        }
        if !self.keep {
            if let Err(e) = self.controller.delete(&self.handle, &self.name, self.shutdown_deadline) {
                self.issues.push(format!("delete failed: {e}"));
            }
        }
    }
}

impl<'a, 'b> Drop for SnapshotGuard<'a, 'b> {
    fn drop(&mut self) {
        self.run_cleanup();
        for issue in &self.issues {
            warn!("{issue}");
        }
    }
}

fn shq(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// 169.254.0.0/16 and 127.0.0.0/8 are excluded from IP resolution (spec
/// §4.5 "IP resolution").
fn is_usable_ip(ip: &str) -> bool {
    !ip.starts_with("169.254.") && !ip.starts_with("127.")
}

pub struct ChallengeEngine<'a> {
    pub gateway: &'a dyn HypervisorGateway,
    pub agent: &'a dyn GuestAgent,
    pub ssh: &'a dyn SshClient,
    pub config: EngineConfig,
}

impl<'a> ChallengeEngine<'a> {
    pub fn new(gateway: &'a dyn HypervisorGateway, agent: &'a dyn GuestAgent, ssh: &'a dyn SshClient, config: EngineConfig) -> Self {
        ChallengeEngine { gateway, agent, ssh, config }
    }

    /// Three-tier IP resolution (spec §4.5): libvirt's agent-backed
    /// interface-address lookup first, then the `guest-network-get-interfaces`
    /// JSON-RPC fallback, then DHCP leases as a last resort.
    fn resolve_ip(&self, handle: &DomainHandle) -> Result<String> {
        if let Ok(ips) = self.gateway.agent_interface_ipv4s(handle) {
            if let Some(ip) = ips.iter().find(|ip| is_usable_ip(ip)) {
                return Ok(ip.clone());
            }
        }
        if let Ok(ifaces) = self.agent.enumerate_interfaces(handle) {
            if let Some(ip) = ifaces
                .iter()
                .filter_map(|i| i.ipv4.as_deref())
                .find(|ip| is_usable_ip(ip))
            {
                return Ok(ip.to_string());
            }
        }
        if let Some(ip) = self.gateway.dhcp_lease_ip(handle)?.filter(|ip| is_usable_ip(ip)) {
            return Ok(ip);
        }
        Err(LpemError::Network(format!(
            "could not resolve an IP address for '{}'",
            handle.name
        )))
    }

    /// Implements the session algorithm of spec §4.5 verbatim.
    pub fn run_challenge(
        &self,
        gateway_handle: DomainHandle,
        descriptor: &ChallengeDescriptor,
        user_done: mpsc::Receiver<UserSignal>,
        simulate_user: bool,
        requested_hint_indices: &[usize],
    ) -> Result<SessionRecord> {
        let controller = SnapshotController::new(self.gateway, self.agent);
        let snap_name = format!("{}-{}", self.config.snapshot_prefix, descriptor.id);

        if self.gateway.snapshot_exists(&gateway_handle, &snap_name)? {
            controller.delete(&gateway_handle, &snap_name, self.config.shutdown_deadline)?;
        }

        let mut guard = SnapshotGuard::new(
            &controller,
            gateway_handle.clone(),
            snap_name.clone(),
            self.config.shutdown_deadline,
            self.config.keep_snapshot,
        );

        let body = (|| -> Result<SessionRecord> {
            controller.create(&gateway_handle, &snap_name)?;
            guard.arm();

            self.gateway.start(&gateway_handle)?;

            let ip = self.resolve_ip(&gateway_handle)?;
            self.ssh.wait_ready(
                &ip,
                &self.config.ssh_user,
                &self.config.ssh_key_path,
                self.config.readiness_timeout,
                self.config.readiness_poll_interval,
            )?;

            for step in &descriptor.setup {
                let SetupStep::RunCommand { command } = step;
                let result = self.ssh.exec(
                    &ip,
                    &self.config.ssh_user,
                    &self.config.ssh_key_path,
                    command,
                    &ExecOptions {
                        timeout: Some(self.config.package_command_timeout),
                        stdin: None,
                        pty: false,
                    },
                )?;
                if !matches!(result.exit_status, ExitStatus::Code(0)) || result.error.is_some() {
                    return Ok(SessionRecord {
                        all_ok: false,
                        score: 0,
                        per_step: Vec::new(),
                        flag: None,
                        aborted: true,
                        cleanup_issues: Vec::new(),
                        warnings: vec![format!("setup step '{command}' failed, session aborted")],
                    });
                }
            }

            if simulate_user {
                if let Some(sim_command) = &descriptor.user_action_simulation {
                    let result = self.ssh.exec(
                        &ip,
                        &self.config.ssh_user,
                        &self.config.ssh_key_path,
                        sim_command,
                        &ExecOptions {
                            timeout: Some(self.config.command_timeout),
                            stdin: None,
                            pty: false,
                        },
                    );
                    match result {
                        Ok(r) if !matches!(r.exit_status, ExitStatus::Code(0)) => {
                            warn!(command = sim_command, "user-action simulation exited non-zero");
                        }
                        Err(e) => warn!(error = %e, "user-action simulation failed to execute"),
                        _ => {}
                    }
                }
            } else {
                match user_done.recv() {
                    Ok(UserSignal::Done) | Err(_) => {}
                    Ok(UserSignal::Cancelled) => {
                        return Ok(SessionRecord {
                            all_ok: false,
                            score: 0,
                            per_step: Vec::new(),
                            flag: None,
                            aborted: true,
                            cleanup_issues: Vec::new(),
                            warnings: vec!["session cancelled while waiting for user".to_string()],
                        });
                    }
                }
            }

            let mut per_step = Vec::with_capacity(descriptor.validation.len());
            let mut all_ok = true;
            for (index, step) in descriptor.validation.iter().enumerate() {
                let record = run_validator(self.ssh, &ip, &self.config, index, step)?;
                let passed = record.passed;
                per_step.push(record);
                if !passed {
                    all_ok = false;
                    break;
                }
            }

            let score = if all_ok {
                let used: i64 = requested_hint_indices
                    .iter()
                    .filter_map(|&i| descriptor.hints.get(i))
                    .map(|h| h.cost)
                    .sum();
                (descriptor.score - used).max(0)
            } else {
                0
            };

            Ok(SessionRecord {
                all_ok,
                score,
                per_step,
                flag: if all_ok { descriptor.flag.clone() } else { None },
                aborted: false,
                cleanup_issues: Vec::new(),
                warnings: Vec::new(),
            })
        })();

        let cleanup_issues = guard.finish();

        let mut record = body?;
        record.cleanup_issues = cleanup_issues;
        if let Some(warning) = controller.take_thaw_warning() {
            record.warnings.push(warning);
        }
        info!(domain = %gateway_handle.name, all_ok = record.all_ok, score = record.score, "challenge session complete");
        Ok(record)
    }
}

fn run_validator(ssh: &dyn SshClient, ip: &str, config: &EngineConfig, index: usize, step: &ValidationStep) -> Result<StepRecord> {
    let user = &config.ssh_user;
    let key = &config.ssh_key_path;
    let timeout = config.command_timeout;

    let exec = |cmd: &str| -> Result<crate::ssh::ExecResult> {
        ssh.exec(
            ip,
            user,
            key,
            cmd,
            &ExecOptions {
                timeout: Some(timeout),
                stdin: None,
                pty: false,
            },
        )
    };

    let (passed, reasons) = match step {
        ValidationStep::RunCommand { command, success_criteria } => {
            let result = exec(command)?;
            let mut reasons = Vec::new();
            let expected_code = success_criteria.exit_status;
            let code_ok = matches!(result.exit_status, ExitStatus::Code(c) if c == expected_code);
            if !code_ok {
                reasons.push(format!("expected exit status {expected_code}, got {:?}", result.exit_status));
            }
            if let Some(expected) = &success_criteria.stdout_equals {
                if &result.stdout != expected {
                    reasons.push("stdout did not equal expected value".to_string());
                }
            }
            if let Some(expected) = &success_criteria.stdout_contains {
                if !result.stdout.contains(expected.as_str()) {
                    reasons.push(format!("stdout did not contain '{expected}'"));
                }
            }
            if let Some(pattern) = &success_criteria.stdout_matches_regex {
                let re = Regex::new(&format!("(?m){pattern}"))
                    .map_err(|e| LpemError::ChallengeValidation(vec![format!("invalid regex: {e}")]))?;
                if !re.is_match(&result.stdout) {
                    reasons.push(format!("stdout did not match /{pattern}/"));
                }
            }
            if success_criteria.stderr_empty && !result.stderr.is_empty() {
                reasons.push("stderr was not empty".to_string());
            }
            if let Some(expected) = &success_criteria.stderr_contains {
                if !result.stderr.contains(expected.as_str()) {
                    reasons.push(format!("stderr did not contain '{expected}'"));
                }
            }
            (reasons.is_empty(), reasons)
        }
        ValidationStep::CheckServiceStatus { service, expected_status, check_enabled } => {
            let result = exec(&format!("systemctl is-active {}", shq(service)))?;
            let observed = match result.exit_status {
                ExitStatus::Code(0) => ServiceStatus::Active,
                ExitStatus::Code(3) => ServiceStatus::Inactive,
                _ => ServiceStatus::Failed,
            };
            let mut reasons = Vec::new();
            if observed != *expected_status {
                reasons.push(format!("service '{service}' is {observed:?}, expected {expected_status:?}"));
            }
            if *check_enabled {
                let enabled = exec(&format!("systemctl is-enabled {}", shq(service)))?;
                if !matches!(enabled.exit_status, ExitStatus::Code(0)) {
                    reasons.push(format!("service '{service}' is not enabled"));
                }
            }
            (reasons.is_empty(), reasons)
        }
        ValidationStep::CheckPortListening { port, protocol, expected_state } => {
            let flag = match protocol {
                PortProtocol::Tcp => "t",
                PortProtocol::Udp => "u",
            };
            let cmd = format!(
                "ss -nl{flag}p | awk -v port=\":{port}\" '$1 == \"LISTEN\" && index($4, port) == (length($4) - length(port) + 1) {{found=1}} END {{exit !found}}'"
            );
            let result = exec(&cmd)?;
            let listening = matches!(result.exit_status, ExitStatus::Code(0));
            let mut reasons = Vec::new();
            if listening != *expected_state {
                reasons.push(format!(
                    "port {port}/{protocol:?} listening={listening}, expected {expected_state}"
                ));
            }
            (reasons.is_empty(), reasons)
        }
        ValidationStep::CheckFileExists { path, expected_state, file_type } => {
            let flag = match file_type {
                FileType::Any => "e",
                FileType::File => "f",
                FileType::Directory => "d",
            };
            let result = exec(&format!("test -{flag} {}", shq(path)))?;
            let exists = matches!(result.exit_status, ExitStatus::Code(0));
            let mut reasons = Vec::new();
            if exists != *expected_state {
                reasons.push(format!("path '{path}' exists={exists}, expected {expected_state}"));
            }
            (reasons.is_empty(), reasons)
        }
        ValidationStep::CheckFileContains { path, expected_state, text, matches_regex } => {
            let readable = exec(&format!("test -r {}", shq(path)))?;
            if !matches!(readable.exit_status, ExitStatus::Code(0)) {
                return Ok(if !*expected_state {
                    StepRecord { index, passed: true, reasons: Vec::new() }
                } else {
                    StepRecord {
                        index,
                        passed: false,
                        reasons: vec![format!("path '{path}' is not readable")],
                    }
                });
            }
            let grep_cmd = if let Some(text) = text {
                format!("grep -qF {} {}", shq(text), shq(path))
            } else {
                let pattern = matches_regex.as_deref().unwrap_or_default();
                format!("grep -qE {} {}", shq(pattern), shq(path))
            };
            let result = exec(&grep_cmd)?;
            let code = match result.exit_status {
                ExitStatus::Code(c) => c,
                _ => {
                    return Err(LpemError::ChallengeValidation(vec![format!(
                        "grep against '{path}' did not complete"
                    )]))
                }
            };
            if code > 1 {
                return Err(LpemError::ChallengeValidation(vec![format!(
                    "grep against '{path}' errored with exit {code}"
                )]));
            }
            let found = code == 0;
            let mut reasons = Vec::new();
            if found != *expected_state {
                reasons.push(format!("path '{path}' contains-match={found}, expected {expected_state}"));
            }
            (reasons.is_empty(), reasons)
        }
    };

    Ok(StepRecord { index, passed, reasons })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{Hint, SuccessCriteria};
    use crate::guest_agent::mock::MockGuestAgent;
    use crate::guest_agent::AgentReply;
    use crate::hypervisor::mock::{sample_domain_xml, MockDomain, MockGateway};
    use crate::ssh::mock::MockSshClient;
    use crate::ssh::ExecResult;

    fn descriptor(id: &str, validation: Vec<ValidationStep>, score: i64) -> ChallengeDescriptor {
        ChallengeDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            description: "test challenge".to_string(),
            category: None,
            difficulty: None,
            score,
            concepts: Vec::new(),
            setup: Vec::new(),
            user_action_simulation: None,
            validation,
            hints: Vec::new(),
            flag: Some("LPEM{test}".to_string()),
        }
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            ssh_user: "student".to_string(),
            ssh_key_path: "/tmp/student_key".to_string(),
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
            package_command_timeout: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(1),
            readiness_poll_interval: Duration::from_millis(10),
            shutdown_deadline: Duration::from_secs(1),
            snapshot_prefix: "lpem".to_string(),
            keep_snapshot: false,
        }
    }

    /// A domain with one file-backed disk (so the snapshot plan has
    /// something to shadow) and a reachable IP via the agent-backed tier,
    /// so `resolve_ip` never falls through to the JSON-RPC or DHCP tiers
    /// unless a test clears `agent_ips` itself.
    fn setup() -> (MockGateway, MockGuestAgent, MockSshClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let base_disk = dir.path().join("base.qcow2").to_string_lossy().into_owned();
        let gw = MockGateway::new();
        gw.add_domain(MockDomain {
            name: "vm1".to_string(),
            active: false,
            xml: sample_domain_xml("vm1", "vda", &base_disk),
            memory_kb: 1024,
            max_memory_kb: 1024,
            vcpus: 1,
        });
        *gw.agent_ips.borrow_mut() = vec!["10.0.0.5".to_string()];

        let agent = MockGuestAgent::new();
        agent.set_reply("guest-fsfreeze-freeze", Ok(AgentReply::Return(serde_json::json!(1))));
        agent.set_reply("guest-fsfreeze-thaw", Ok(AgentReply::Return(serde_json::json!(1))));

        let ssh = MockSshClient::new();
        (gw, agent, ssh, dir)
    }

    fn ok(stdout: &str) -> ExecResult {
        ExecResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: ExitStatus::Code(0),
            error: None,
        }
    }

    fn failed(code: i32) -> ExecResult {
        ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_status: ExitStatus::Code(code),
            error: None,
        }
    }

    #[test]
    fn s1_matching_hostname_all_ok_with_full_score() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("hostname", ok("practice-vm\n"));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let desc = descriptor(
            "hostname-ok",
            vec![ValidationStep::RunCommand {
                command: "hostname".to_string(),
                success_criteria: SuccessCriteria {
                    stdout_contains: Some("practice".to_string()),
                    ..Default::default()
                },
            }],
            100,
        );
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle.clone(), &desc, rx, true, &[]).unwrap();

        assert!(record.all_ok);
        assert_eq!(record.score, 100);
        assert_eq!(record.per_step.len(), 1);
        assert!(record.per_step[0].passed);
        assert!(record.cleanup_issues.is_empty());
        assert!(gw.snapshot_list_names(&handle).unwrap().is_empty());
    }

    #[test]
    fn s2_mismatched_hostname_fails_with_zero_score() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("hostname", ok("ubuntu\n"));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let desc = descriptor(
            "hostname-ok",
            vec![ValidationStep::RunCommand {
                command: "hostname".to_string(),
                success_criteria: SuccessCriteria {
                    stdout_contains: Some("practice".to_string()),
                    ..Default::default()
                },
            }],
            100,
        );
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle.clone(), &desc, rx, true, &[]).unwrap();

        assert!(!record.all_ok);
        assert_eq!(record.score, 0);
        assert_eq!(record.per_step.len(), 1);
        assert!(!record.per_step[0].passed);
        assert!(record.per_step[0]
            .reasons
            .iter()
            .any(|r| r.contains("stdout did not contain")));
        assert!(gw.snapshot_list_names(&handle).unwrap().is_empty());
    }

    #[test]
    fn s3_listening_port_passes_against_local_address_field() {
        let (gw, agent, ssh, _dir) = setup();
        let cmd = "ss -nltp | awk -v port=\":22\" '$1 == \"LISTEN\" && index($4, port) == (length($4) - length(port) + 1) {found=1} END {exit !found}'";
        ssh.set_response(cmd, ok(""));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let desc = descriptor(
            "sshd-listening",
            vec![ValidationStep::CheckPortListening {
                port: 22,
                protocol: PortProtocol::Tcp,
                expected_state: true,
            }],
            100,
        );
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle, &desc, rx, true, &[]).unwrap();

        assert!(record.all_ok);
        assert!(record.per_step[0].passed);
    }

    #[test]
    fn s4_unreadable_file_reports_not_readable() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("test -r '/etc/motd'", failed(1));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let desc = descriptor(
            "motd-welcome",
            vec![ValidationStep::CheckFileContains {
                path: "/etc/motd".to_string(),
                expected_state: true,
                text: Some("Welcome".to_string()),
                matches_regex: None,
            }],
            100,
        );
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle, &desc, rx, true, &[]).unwrap();

        assert!(!record.all_ok);
        assert_eq!(record.score, 0);
        assert!(record.per_step[0]
            .reasons
            .iter()
            .any(|r| r.contains("not readable")));
    }

    #[test]
    fn s5_failing_setup_step_aborts_before_any_validation() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("false", failed(1));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let mut desc = descriptor(
            "broken-setup",
            vec![ValidationStep::RunCommand {
                command: "true".to_string(),
                success_criteria: SuccessCriteria::default(),
            }],
            100,
        );
        desc.setup = vec![SetupStep::RunCommand { command: "false".to_string() }];
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle.clone(), &desc, rx, true, &[]).unwrap();

        assert!(!record.all_ok);
        assert_eq!(record.score, 0);
        assert!(record.aborted);
        assert!(record.per_step.is_empty());
        assert!(record.warnings.iter().any(|w| w.contains("setup") && w.contains("failed")));
        assert!(gw.snapshot_list_names(&handle).unwrap().is_empty());
    }

    #[test]
    fn s6_hint_costs_are_subtracted_from_base_score() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("true", ok(""));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let mut desc = descriptor(
            "hinted",
            vec![ValidationStep::RunCommand {
                command: "true".to_string(),
                success_criteria: SuccessCriteria::default(),
            }],
            100,
        );
        desc.hints = vec![
            Hint { text: "hint one".to_string(), cost: 10 },
            Hint { text: "hint two".to_string(), cost: 20 },
        ];
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle, &desc, rx, true, &[0, 1]).unwrap();

        assert!(record.all_ok);
        assert_eq!(record.score, 70);
    }

    #[test]
    fn score_never_goes_negative_when_hint_costs_exceed_base() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("true", ok(""));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let mut desc = descriptor(
            "over-hinted",
            vec![ValidationStep::RunCommand {
                command: "true".to_string(),
                success_criteria: SuccessCriteria::default(),
            }],
            10,
        );
        desc.hints = vec![Hint { text: "expensive hint".to_string(), cost: 50 }];
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle, &desc, rx, true, &[0]).unwrap();

        assert!(record.all_ok);
        assert_eq!(record.score, 0);
    }

    #[test]
    fn first_validation_failure_stops_remaining_steps() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("step-one", failed(1));
        ssh.set_response("step-two", ok(""));
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let desc = descriptor(
            "two-steps",
            vec![
                ValidationStep::RunCommand {
                    command: "step-one".to_string(),
                    success_criteria: SuccessCriteria::default(),
                },
                ValidationStep::RunCommand {
                    command: "step-two".to_string(),
                    success_criteria: SuccessCriteria::default(),
                },
            ],
            100,
        );
        let (_h, rx) = user_done_channel();

        let record = engine.run_challenge(handle, &desc, rx, true, &[]).unwrap();

        assert!(!record.all_ok);
        assert_eq!(record.per_step.len(), 1);
        assert!(!ssh.exec_log.borrow().iter().any(|c| c == "step-two"));
    }

    #[test]
    fn cancelled_session_aborts_and_still_cleans_up() {
        let (gw, agent, ssh, _dir) = setup();
        let handle = gw.lookup("vm1").unwrap();
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let desc = descriptor(
            "hostname-ok",
            vec![ValidationStep::RunCommand {
                command: "hostname".to_string(),
                success_criteria: SuccessCriteria::default(),
            }],
            100,
        );
        let (user_done, rx) = user_done_channel();
        user_done.cancel();

        let record = engine.run_challenge(handle.clone(), &desc, rx, false, &[]).unwrap();

        assert!(!record.all_ok);
        assert!(record.aborted);
        assert_eq!(record.score, 0);
        assert!(record.per_step.is_empty());
        assert!(record.warnings.iter().any(|w| w.contains("cancelled")));
        assert!(record.cleanup_issues.is_empty());
        assert!(gw.snapshot_list_names(&handle).unwrap().is_empty());
    }

    #[test]
    fn stale_handle_is_rejected_before_any_snapshot_is_touched() {
        let (gw, agent, ssh, _dir) = setup();
        ssh.set_response("hostname", ok("practice-vm\n"));
        let engine = ChallengeEngine::new(&gw, &agent, &ssh, engine_config());
        let mut handle = gw.lookup("vm1").unwrap();
        let desc = descriptor(
            "hostname-ok",
            vec![ValidationStep::RunCommand {
                command: "hostname".to_string(),
                success_criteria: SuccessCriteria {
                    stdout_contains: Some("practice".to_string()),
                    ..Default::default()
                },
            }],
            100,
        );
        handle.generation += 1;
        let (_h, rx) = user_done_channel();

        let err = engine.run_challenge(handle, &desc, rx, true, &[]).unwrap_err();
        assert!(matches!(err, LpemError::Internal(_)));
    }

    #[test]
    fn snapshot_guard_reports_cleanup_issues_instead_of_panicking() {
        let (gw, agent, _ssh, _dir) = setup();
        let handle = gw.lookup("vm1").unwrap();
        let controller = SnapshotController::new(&gw, &agent);
        controller.create(&handle, "lpem-guard-test").unwrap();

        let mut guard = SnapshotGuard::new(
            &controller,
            handle.clone(),
            "lpem-guard-test".to_string(),
            Duration::from_secs(1),
            false,
        );
        guard.arm();

        // Simulate the snapshot disappearing out from under the guard (an
        // external race), so revert has nothing left to act on.
        gw.snapshot_delete(&handle, "lpem-guard-test").unwrap();

        let issues = guard.finish();
        assert!(!issues.is_empty());
        assert!(issues.iter().any(|i| i.contains("revert failed")));
    }
}
