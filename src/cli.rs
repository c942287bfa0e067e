// src/cli.rs
// Minimal CLI surface (spec §6 "Process surface"): just enough to exercise
// the library end to end and honor the exit-code contract. Flags, env vars,
// and textual output beyond this are consciously unspecified.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::challenge::ChallengeDescriptor;
use crate::config::Config;
use crate::engine::{user_done_channel, ChallengeEngine, EngineConfig};
use crate::errors::LpemError;
use crate::guest_agent::QemuGuestAgent;
use crate::hypervisor::{HypervisorGateway, LibvirtGateway};
use crate::snapshot::{SnapshotController, SnapshotListEntry};
use crate::ssh::Ssh2Client;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Linux Practice Environment Manager", long_about = None)]
pub struct Cli {
    /// Optional path to the lpem configuration file
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a challenge against a VM, end to end
    Run {
        challenge: PathBuf,
        #[clap(long)]
        vm: String,
        /// Drive through the challenge without waiting for interactive input
        #[clap(long)]
        simulate: bool,
    },
    /// VM inspection
    #[clap(subcommand)]
    Vm(VmCommands),
    /// Snapshot inspection
    #[clap(subcommand)]
    Snapshot(SnapshotCommands),
}

#[derive(Subcommand, Debug)]
pub enum VmCommands {
    List,
    Info { name: String },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    List { vm: String },
    Revert { vm: String, name: String },
    Delete { vm: String, name: String },
}

/// Exit-code contract (spec §6): 0 success, 1 operational error, 2
/// internal/unexpected error, 130 user-interrupt (handled by the default
/// SIGINT disposition, not by this function).
pub fn exit_code_for(err: &LpemError) -> i32 {
    match err {
        LpemError::Internal(_) => 2,
        _ => 1,
    }
}

pub fn run(cli_args: Cli, config: &Config) -> i32 {
    match dispatch(cli_args, config) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "command failed");
            exit_code_for(&e)
        }
    }
}

fn dispatch(cli_args: Cli, config: &Config) -> Result<(), LpemError> {
    let gateway = LibvirtGateway::open(&config.hypervisor.uri, &config.hypervisor.image_dir)?;
    let agent = QemuGuestAgent::new(&config.hypervisor.uri)?;
    let ssh = Ssh2Client::new(Duration::from_secs(config.ssh.connect_timeout_secs));

    match cli_args.command {
        Commands::Vm(VmCommands::List) => {
            for summary in gateway.list_domains()? {
                println!("{}\t{:?}", summary.name, summary.state);
            }
            Ok(())
        }
        Commands::Vm(VmCommands::Info { name }) => {
            let handle = gateway.lookup(&name)?;
            let info = gateway.info(&handle)?;
            println!(
                "{name}: state={:?} vcpus={} memory_kb={}",
                info.state, info.vcpus, info.memory_kb
            );
            Ok(())
        }
        Commands::Snapshot(SnapshotCommands::List { vm }) => {
            let handle = gateway.lookup(&vm)?;
            let controller = SnapshotController::new(&gateway, &agent);
            for entry in controller.list(&handle)? {
                match entry {
                    SnapshotListEntry::Present(info) => println!("{}\t{:?}", info.name, info.state),
                    SnapshotListEntry::Disappeared(name) => println!("{name}\t<disappeared>"),
                }
            }
            Ok(())
        }
        Commands::Snapshot(SnapshotCommands::Revert { vm, name }) => {
            let handle = gateway.lookup(&vm)?;
            let controller = SnapshotController::new(&gateway, &agent);
            controller.revert(
                &handle,
                &name,
                Duration::from_secs(config.hypervisor.shutdown_deadline_secs),
            )
        }
        Commands::Snapshot(SnapshotCommands::Delete { vm, name }) => {
            let handle = gateway.lookup(&vm)?;
            let controller = SnapshotController::new(&gateway, &agent);
            controller.delete(
                &handle,
                &name,
                Duration::from_secs(config.hypervisor.shutdown_deadline_secs),
            )
        }
        Commands::Run { challenge, vm, simulate } => {
            let descriptor = ChallengeDescriptor::load_file(&challenge)
                .map_err(|reasons| LpemError::ChallengeLoad(reasons.join("; ")))?;
            let handle = gateway.lookup(&vm)?;

            let engine_config = EngineConfig {
                ssh_user: config.ssh.user.clone(),
                ssh_key_path: config.ssh.key_path.clone(),
                connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
                command_timeout: Duration::from_secs(config.ssh.command_timeout_secs),
                package_command_timeout: Duration::from_secs(config.ssh.package_command_timeout_secs),
                readiness_timeout: Duration::from_secs(config.ssh.readiness_timeout_secs),
                readiness_poll_interval: Duration::from_secs(config.ssh.readiness_poll_interval_secs),
                shutdown_deadline: Duration::from_secs(config.hypervisor.shutdown_deadline_secs),
                snapshot_prefix: config.challenge.snapshot_prefix.clone(),
                keep_snapshot: config.challenge.keep_snapshot,
            };
            let engine = ChallengeEngine::new(&gateway, &agent, &ssh, engine_config);
            let (_handle_signal, rx) = user_done_channel();

            let record = engine.run_challenge(handle, &descriptor, rx, simulate, &[])?;
            info!(
                all_ok = record.all_ok,
                score = record.score,
                aborted = record.aborted,
                "session finished"
            );
            if !record.warnings.is_empty() {
                for w in &record.warnings {
                    eprintln!("warning: {w}");
                }
            }
            if !record.all_ok {
                return Err(LpemError::ChallengeValidation(
                    record
                        .per_step
                        .iter()
                        .filter(|s| !s.passed)
                        .flat_map(|s| s.reasons.clone())
                        .collect(),
                ));
            }
            Ok(())
        }
    }
}
