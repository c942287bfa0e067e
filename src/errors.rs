// src/errors.rs
use thiserror::Error;

/// Classification of a guest-agent failure, per the libvirt error code that
/// produced it (spec: AgentCommand is sub-classified as unresponsive /
/// unsupported / protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    Unresponsive,
    Unsupported,
    Protocol,
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentErrorKind::Unresponsive => "unresponsive",
            AgentErrorKind::Unsupported => "unsupported",
            AgentErrorKind::Protocol => "protocol",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug)]
pub enum LpemError {
    #[error("failed to connect to libvirt at {uri}: {source}")]
    LibvirtConnection {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("snapshot operation failed: {0}")]
    SnapshotOperation(String),

    #[error("guest agent command failed ({kind}): {message}")]
    AgentCommand {
        kind: AgentErrorKind,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("SSH transport error: {0}")]
    SshTransport(String),

    #[error("SSH command error: {0}")]
    SshCommand(String),

    #[error("failed to load challenge: {0}")]
    ChallengeLoad(String),

    #[error("challenge validation failed: {}", .0.join(", "))]
    ChallengeValidation(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LpemError>;

// TODO: Add tests asserting cli.rs's exit-code mapping covers every variant
// above (currently enforced by a match with no catch-all in cli.rs).
