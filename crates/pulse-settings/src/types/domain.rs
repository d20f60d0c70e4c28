//! Auth, goal, and logging settings.

use serde::{Deserialize, Serialize};

/// Credential verification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret shared with the credential issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Required `iss` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Required `aud` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Clock skew tolerated on `exp`/`nbf`, in seconds.
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            audience: None,
            leeway_secs: 30,
        }
    }
}

/// When a progress update records a milestone on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MilestoneRule {
    /// Values that are exact multiples of `milestoneStep`.
    #[default]
    Multiple,
    /// Only updates that carry a note.
    NotesOnly,
}

/// Goal state machine policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoalSettings {
    /// Automatic milestone rule.
    pub milestone_rule: MilestoneRule,
    /// Step used by [`MilestoneRule::Multiple`].
    pub milestone_step: f64,
}

impl Default for GoalSettings {
    fn default() -> Self {
        Self {
            milestone_rule: MilestoneRule::Multiple,
            milestone_step: 10.0,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milestone_rule_wire_names() {
        assert_eq!(
            serde_json::to_value(MilestoneRule::NotesOnly).unwrap(),
            "notesOnly"
        );
        assert_eq!(serde_json::to_value(MilestoneRule::Multiple).unwrap(), "multiple");
    }

    #[test]
    fn secret_not_serialized_when_absent() {
        let json = serde_json::to_value(AuthSettings::default()).unwrap();
        assert!(json.get("jwtSecret").is_none());
        assert_eq!(json["leewaySecs"], 30);
    }
}
