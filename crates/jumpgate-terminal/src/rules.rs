// Command rules
//
// A rule is a regex pattern with a category, a risk level, and an action.
// Rules are loaded once per session from the asset's rule-id list and are
// immutable afterwards; policy edits only affect future sessions.

use log::warn;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Deny,
    Permit,
}

/// Which protocol family a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCategory {
    /// Applies to every interactive protocol.
    General,
    /// Shell-like targets: ssh, telnet.
    Shell,
    /// Database targets: redis, mysql, mongodb, postgresql.
    Database,
}

impl RuleCategory {
    pub fn applies_to(&self, protocol: &str) -> bool {
        match self {
            RuleCategory::General => true,
            RuleCategory::Shell => matches!(protocol, "ssh" | "telnet"),
            RuleCategory::Database => {
                matches!(protocol, "redis" | "mysql" | "mongodb" | "postgresql")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRule {
    pub id: i64,
    pub name: String,
    pub pattern: String,
    pub category: RuleCategory,
    pub risk_level: u8,
    pub enabled: bool,
    pub action: RuleAction,
}

impl CommandRule {
    pub fn deny(id: i64, name: &str, pattern: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            pattern: pattern.to_string(),
            category: RuleCategory::General,
            risk_level: 3,
            enabled: true,
            action: RuleAction::Deny,
        }
    }
}

struct Compiled {
    regex: Regex,
    rule: CommandRule,
}

/// The session's compiled, frozen rule set.
pub struct CompiledRules {
    protocol: String,
    deny: Vec<Compiled>,
    permit: Vec<Compiled>,
}

impl CompiledRules {
    /// Compile the rules that are enabled and applicable to `protocol`.
    ///
    /// Rules with invalid patterns are skipped with a warning; a broken
    /// rule must not take every session down with it.
    pub fn compile(protocol: &str, rules: &[CommandRule]) -> Self {
        let mut deny = Vec::new();
        let mut permit = Vec::new();
        for rule in rules {
            if !rule.enabled || !rule.category.applies_to(protocol) {
                continue;
            }
            match Regex::new(&rule.pattern) {
                Ok(regex) => {
                    let compiled = Compiled {
                        regex,
                        rule: rule.clone(),
                    };
                    match rule.action {
                        RuleAction::Deny => deny.push(compiled),
                        RuleAction::Permit => permit.push(compiled),
                    }
                }
                Err(e) => {
                    warn!("skipping rule {} ({}): bad pattern: {}", rule.id, rule.name, e);
                }
            }
        }
        Self {
            protocol: protocol.to_string(),
            deny,
            permit,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Whether the committed command is forbidden.
    ///
    /// Deny wins: a command matching both a permit and a deny rule is
    /// forbidden.
    pub fn is_forbidden(&self, command: &str) -> bool {
        self.matched_deny(command).is_some()
    }

    /// The highest-risk deny rule matching the command, if any.
    pub fn matched_deny(&self, command: &str) -> Option<&CommandRule> {
        self.deny
            .iter()
            .filter(|c| c.regex.is_match(command))
            .map(|c| &c.rule)
            .max_by_key(|r| r.risk_level)
    }

    /// Whether any permit rule matches (used for audit classification).
    pub fn matched_permit(&self, command: &str) -> Option<&CommandRule> {
        self.permit
            .iter()
            .find(|c| c.regex.is_match(command))
            .map(|c| &c.rule)
    }

    pub fn is_empty(&self) -> bool {
        self.deny.is_empty() && self.permit.is_empty()
    }
}
