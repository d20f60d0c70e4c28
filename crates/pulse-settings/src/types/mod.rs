//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a settings file
//! only needs the keys it overrides.

mod domain;
mod server;

pub use domain::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "sync": { "idleThresholdSecs": 600 },
///   "goals": { "milestoneRule": "notesOnly" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseSettings {
    /// Network listener settings.
    pub server: ServerSettings,
    /// Fan-out and idle reaping settings.
    pub sync: SyncSettings,
    /// Credential verification settings.
    pub auth: AuthSettings,
    /// Goal state machine policy.
    pub goals: GoalSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl PulseSettings {
    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> crate::Result<()> {
        if self.sync.reap_interval_secs == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "sync.reapIntervalSecs must be positive".into(),
            ));
        }
        if self.sync.send_timeout_ms == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "sync.sendTimeoutMs must be positive".into(),
            ));
        }
        if self.sync.outbound_buffer == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "sync.outboundBuffer must be positive".into(),
            ));
        }
        let step = self.goals.milestone_step;
        if self.goals.milestone_rule == MilestoneRule::Multiple && !(step.is_finite() && step > 0.0)
        {
            return Err(crate::SettingsError::InvalidValue(format!(
                "goals.milestoneStep must be a positive number, got {step}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_validate() {
        assert!(PulseSettings::default().validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: PulseSettings =
            serde_json::from_str(r#"{"server":{"port":9999}}"#).unwrap();
        assert_eq!(settings.server.port, 9999);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.sync.idle_threshold_secs, 1800);
    }

    #[test]
    fn zero_reap_interval_rejected() {
        let mut settings = PulseSettings::default();
        settings.sync.reap_interval_secs = 0;
        assert_matches!(
            settings.validate(),
            Err(crate::SettingsError::InvalidValue(msg)) if msg.contains("reapIntervalSecs")
        );
    }

    #[test]
    fn negative_milestone_step_rejected() {
        let mut settings = PulseSettings::default();
        settings.goals.milestone_step = -5.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn step_ignored_when_notes_only() {
        let settings: PulseSettings = serde_json::from_str(
            r#"{"goals":{"milestoneRule":"notesOnly","milestoneStep":0}}"#,
        )
        .unwrap();
        assert_eq!(settings.goals.milestone_rule, MilestoneRule::NotesOnly);
        assert!(settings.validate().is_ok());
    }
}
