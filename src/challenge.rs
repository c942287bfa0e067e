// src/challenge.rs
// C5 data model: challenge descriptor, validation-step grammar, YAML loader.

use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;

pub const DEFAULT_CHALLENGE_SCORE: i64 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessCriteria {
    #[serde(default = "default_exit_status")]
    pub exit_status: i32,
    pub stdout_equals: Option<String>,
    pub stdout_contains: Option<String>,
    pub stdout_matches_regex: Option<String>,
    #[serde(default)]
    pub stderr_empty: bool,
    pub stderr_contains: Option<String>,
}

fn default_exit_status() -> i32 {
    0
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        SuccessCriteria {
            exit_status: default_exit_status(),
            stdout_equals: None,
            stdout_contains: None,
            stdout_matches_regex: None,
            stderr_empty: false,
            stderr_contains: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl Default for PortProtocol {
    fn default() -> Self {
        PortProtocol::Tcp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Any,
    File,
    Directory,
}

impl Default for FileType {
    fn default() -> Self {
        FileType::Any
    }
}

/// One `setup` step. Spec §4.5: "currently: run_command" — the grammar
/// leaves room for future kinds but only this one is accepted today.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetupStep {
    RunCommand { command: String },
}

/// One `validation` step — a tagged union over the five kinds in spec §4.5.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationStep {
    RunCommand {
        command: String,
        #[serde(default)]
        success_criteria: SuccessCriteria,
    },
    CheckServiceStatus {
        service: String,
        expected_status: ServiceStatus,
        #[serde(default)]
        check_enabled: bool,
    },
    CheckPortListening {
        port: u16,
        #[serde(default)]
        protocol: PortProtocol,
        expected_state: bool,
    },
    CheckFileExists {
        path: String,
        expected_state: bool,
        #[serde(default)]
        file_type: FileType,
    },
    CheckFileContains {
        path: String,
        expected_state: bool,
        text: Option<String>,
        matches_regex: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hint {
    pub text: String,
    pub cost: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub difficulty: Option<String>,
    #[serde(default = "default_score")]
    pub score: i64,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub setup: Vec<SetupStep>,
    pub user_action_simulation: Option<String>,
    pub validation: Vec<ValidationStep>,
    #[serde(default)]
    pub hints: Vec<Hint>,
    pub flag: Option<String>,
}

fn default_score() -> i64 {
    DEFAULT_CHALLENGE_SCORE
}

const REQUIRED_TOP_LEVEL_KEYS: &[&str] = &["id", "name", "description", "validation"];
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "id",
    "name",
    "description",
    "category",
    "difficulty",
    "score",
    "concepts",
    "setup",
    "user_action_simulation",
    "validation",
    "hints",
    "flag",
];

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

impl ChallengeDescriptor {
    /// Parses and validates a YAML document: required keys present, no
    /// unknown top-level keys, `id` charset, non-empty `validation`, and
    /// every step kind-checked against its schema. Returns either a typed
    /// descriptor or a list of human-readable reasons (spec §4.5 "Loader").
    pub fn load_str(yaml: &str) -> Result<Self, Vec<String>> {
        let raw: Value =
            serde_yaml::from_str(yaml).map_err(|e| vec![format!("invalid YAML: {e}")])?;

        let mapping = raw
            .as_mapping()
            .ok_or_else(|| vec!["challenge document must be a YAML mapping".to_string()])?;

        let mut reasons = Vec::new();

        for key in REQUIRED_TOP_LEVEL_KEYS {
            if !mapping.contains_key(Value::String((*key).to_string())) {
                reasons.push(format!("missing required top-level key '{key}'"));
            }
        }

        for key in mapping.keys() {
            if let Some(key_str) = key.as_str() {
                if !KNOWN_TOP_LEVEL_KEYS.contains(&key_str) {
                    reasons.push(format!("unknown top-level key '{key_str}'"));
                }
            } else {
                reasons.push("top-level keys must be strings".to_string());
            }
        }

        if !reasons.is_empty() {
            return Err(reasons);
        }

        let descriptor: ChallengeDescriptor = serde_yaml::from_value(raw)
            .map_err(|e| vec![format!("schema validation failed: {e}")])?;

        if !is_valid_id(&descriptor.id) {
            reasons.push(format!(
                "id '{}' must match [A-Za-z0-9._-]+",
                descriptor.id
            ));
        }
        if descriptor.validation.is_empty() {
            reasons.push("validation must be a non-empty list".to_string());
        }
        for (i, step) in descriptor.validation.iter().enumerate() {
            if let Err(e) = validate_step_schema(step) {
                reasons.push(format!("validation step {i}: {e}"));
            }
        }

        if reasons.is_empty() {
            Ok(descriptor)
        } else {
            Err(reasons)
        }
    }

    pub fn load_file(path: &std::path::Path) -> Result<Self, Vec<String>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| vec![format!("failed to read '{}': {e}", path.display())])?;
        Self::load_str(&contents)
    }
}

fn validate_step_schema(step: &ValidationStep) -> Result<(), String> {
    match step {
        ValidationStep::CheckFileContains {
            text, matches_regex, ..
        } => {
            match (text, matches_regex) {
                (Some(_), Some(_)) => {
                    return Err("check_file_contains requires exactly one of text or matches_regex, not both".into())
                }
                (None, None) => {
                    return Err("check_file_contains requires exactly one of text or matches_regex".into())
                }
                _ => {}
            }
            if let Some(pattern) = matches_regex {
                Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
            }
            Ok(())
        }
        ValidationStep::RunCommand { success_criteria, .. } => {
            if let Some(pattern) = &success_criteria.stdout_matches_regex {
                Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
id: basic-user-mgmt
name: Basic User Management
description: Create a user and verify it exists.
validation:
  - type: run_command
    command: id student
    success_criteria:
      exit_status: 0
"#;

    #[test]
    fn minimal_valid_document_parses_with_defaults() {
        let desc = ChallengeDescriptor::load_str(MINIMAL_YAML).unwrap();
        assert_eq!(desc.score, 100);
        assert!(desc.concepts.is_empty());
        assert!(desc.hints.is_empty());
        assert!(desc.setup.is_empty());
    }

    #[test]
    fn missing_required_key_is_rejected_with_reason() {
        let yaml = r#"
name: No Id Here
description: broken
validation:
  - type: run_command
    command: "true"
"#;
        let err = ChallengeDescriptor::load_str(yaml).unwrap_err();
        assert!(err.iter().any(|r| r.contains("missing required top-level key 'id'")));
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let yaml = format!("{MINIMAL_YAML}\nbogus_key: true\n");
        let err = ChallengeDescriptor::load_str(&yaml).unwrap_err();
        assert!(err.iter().any(|r| r.contains("unknown top-level key 'bogus_key'")));
    }

    #[test]
    fn invalid_id_charset_is_rejected() {
        let yaml = MINIMAL_YAML.replace("basic-user-mgmt", "bad id!");
        let err = ChallengeDescriptor::load_str(&yaml).unwrap_err();
        assert!(err.iter().any(|r| r.contains("must match")));
    }

    #[test]
    fn empty_validation_list_is_rejected() {
        let yaml = r#"
id: empty-validation
name: Empty
description: none
validation: []
"#;
        let err = ChallengeDescriptor::load_str(yaml).unwrap_err();
        assert!(err.iter().any(|r| r.contains("non-empty")));
    }

    #[test]
    fn check_file_contains_requires_exactly_one_of_text_or_regex() {
        let yaml = r#"
id: file-check
name: File Check
description: both set, should fail
validation:
  - type: check_file_contains
    path: /etc/hosts
    expected_state: true
    text: "localhost"
    matches_regex: "^local"
"#;
        let err = ChallengeDescriptor::load_str(yaml).unwrap_err();
        assert!(err.iter().any(|r| r.contains("exactly one of text or matches_regex")));
    }

    #[test]
    fn full_grammar_round_trips() {
        let yaml = r#"
id: full-example
name: Full Example
description: exercises every step kind
category: networking
difficulty: easy
score: 50
concepts: [systemd, ssh]
setup:
  - type: run_command
    command: systemctl start sshd
validation:
  - type: run_command
    command: "echo hi"
    success_criteria:
      exit_status: 0
      stdout_contains: hi
  - type: check_service_status
    service: sshd
    expected_status: active
    check_enabled: true
  - type: check_port_listening
    port: 22
    protocol: tcp
    expected_state: true
  - type: check_file_exists
    path: /etc/ssh/sshd_config
    expected_state: true
    file_type: file
  - type: check_file_contains
    path: /etc/ssh/sshd_config
    expected_state: true
    text: "Port"
hints:
  - text: "check systemctl status"
    cost: 5
flag: "LPEM{example}"
"#;
        let desc = ChallengeDescriptor::load_str(yaml).unwrap();
        assert_eq!(desc.validation.len(), 5);
        assert_eq!(desc.hints[0].cost, 5);
        assert_eq!(desc.flag.as_deref(), Some("LPEM{example}"));
    }
}
