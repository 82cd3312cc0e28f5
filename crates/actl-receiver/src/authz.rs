//! Same-team authorization for control requests.
//!
//! Runs before any dedup reservation: a denied request must not consume the
//! single-flight slot for its `request_id`. The policy is deny-by-default —
//! unknown teams, unknown senders, unknown targets, and cross-team senders
//! all fail closed.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Policy verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allow,
    /// Reason is surfaced as the `rejected` ack detail and audit metadata.
    Deny(String),
}

/// Authorization hook, injected into the dispatcher.
pub trait AuthzPolicy: Send + Sync {
    /// May `sender` deliver control input to `agent_id` within `team`?
    fn check(&self, sender: &str, team: &str, agent_id: &str) -> Access;
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    teams: HashMap<String, TeamEntry>,
}

#[derive(Debug, Deserialize)]
struct TeamEntry {
    #[serde(default)]
    members: Vec<String>,
}

/// Static team roster: each team is a flat member set, and control delivery
/// is allowed only between members of the same team.
#[derive(Debug, Clone, Default)]
pub struct TeamRoster {
    teams: HashMap<String, HashSet<String>>,
}

impl TeamRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a roster from TOML:
    ///
    /// ```toml
    /// [teams.ctl-dev]
    /// members = ["orchestrator", "arch-1", "builder-2"]
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let file: RosterFile = toml::from_str(raw)?;
        let mut roster = Self::new();
        for (team, entry) in file.teams {
            roster.teams.insert(team, entry.members.into_iter().collect());
        }
        Ok(roster)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading roster {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("parsing roster {}", path.display()))
    }

    pub fn add_member(&mut self, team: &str, member: &str) {
        self.teams
            .entry(team.to_string())
            .or_default()
            .insert(member.to_string());
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }
}

impl AuthzPolicy for TeamRoster {
    fn check(&self, sender: &str, team: &str, agent_id: &str) -> Access {
        let Some(members) = self.teams.get(team) else {
            return Access::Deny(format!("unknown team '{team}'"));
        };
        if !members.contains(sender) {
            return Access::Deny(format!("sender '{sender}' is not a member of team '{team}'"));
        }
        if !members.contains(agent_id) {
            return Access::Deny(format!("target '{agent_id}' is not a member of team '{team}'"));
        }
        Access::Allow
    }
}

/// Policy that allows everything. Test plumbing for pipelines where
/// authorization is not the behavior under test.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthzPolicy for AllowAll {
    fn check(&self, _sender: &str, _team: &str, _agent_id: &str) -> Access {
        Access::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> TeamRoster {
        TeamRoster::from_toml_str(
            r#"
            [teams.ctl-dev]
            members = ["orchestrator", "arch-1", "builder-2"]

            [teams.ops]
            members = ["oncall"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn same_team_member_is_allowed() {
        let roster = roster();
        assert_eq!(roster.check("orchestrator", "ctl-dev", "arch-1"), Access::Allow);
    }

    #[test]
    fn unknown_team_is_denied() {
        let roster = roster();
        assert!(matches!(
            roster.check("orchestrator", "ghost-team", "arch-1"),
            Access::Deny(reason) if reason.contains("unknown team")
        ));
    }

    #[test]
    fn cross_team_sender_is_denied() {
        let roster = roster();
        assert!(matches!(
            roster.check("oncall", "ctl-dev", "arch-1"),
            Access::Deny(reason) if reason.contains("not a member")
        ));
    }

    #[test]
    fn unknown_target_is_denied() {
        let roster = roster();
        assert!(matches!(
            roster.check("orchestrator", "ctl-dev", "intruder"),
            Access::Deny(reason) if reason.contains("target 'intruder'")
        ));
    }

    #[test]
    fn empty_roster_denies_everything() {
        let roster = TeamRoster::from_toml_str("").unwrap();
        assert!(matches!(
            roster.check("anyone", "anything", "anywhere"),
            Access::Deny(_)
        ));
    }

    #[test]
    fn add_member_extends_team() {
        let mut roster = roster();
        roster.add_member("ctl-dev", "reviewer-3");
        assert_eq!(roster.check("reviewer-3", "ctl-dev", "arch-1"), Access::Allow);
    }
}
