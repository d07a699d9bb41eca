//! Risk scanning over literal document text
//!
//! Allow-rules strip their matches line by line before deny-rules run, so a
//! narrow safe case (`rm -rf /tmp/x`) can pre-empt a broad dangerous one
//! (`rm -rf /`).

use flowsmith_core::{FlowError, Result, RiskLevel};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

/// A single risk rule
#[derive(Debug, Clone)]
pub struct RiskRule {
    pub level: RiskLevel,
    pub reason: String,
    pub pattern: Regex,
    /// Allow-rules remove matching substrings instead of raising risk
    pub allow: bool,
}

impl RiskRule {
    /// A deny rule raising the risk to `level` when `pattern` matches
    pub fn deny(level: RiskLevel, reason: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self {
            level,
            reason: reason.into(),
            pattern: compile(pattern)?,
            allow: false,
        })
    }

    /// An allow rule stripping `pattern` before deny rules are evaluated
    pub fn allow(reason: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self {
            level: RiskLevel::Low,
            reason: reason.into(),
            pattern: compile(pattern)?,
            allow: true,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| FlowError::InvalidInput(format!("invalid risk pattern {:?}: {}", pattern, e)))
}

// (level, reason, pattern, allow)
const DEFAULT_RULES: &[(RiskLevel, &str, &str, bool)] = &[
    (RiskLevel::Low, "rm -rf in temp", r"(?i)\brm\s+-rf\s+/(tmp|var/tmp)\b", true),
    (RiskLevel::High, "rm -rf on root", r"(?i)\brm\s+-rf\s+/", false),
    (RiskLevel::High, "mkfs detected", r"(?i)\bmkfs\b", false),
    (RiskLevel::High, "shutdown/reboot", r"(?i)\b(shutdown|reboot|poweroff|init\s+0)\b", false),
    (RiskLevel::High, "wipe/format disk", r"(?i)\b(wipefs|dd\s+if=.*of=/dev)\b", false),
    (RiskLevel::Medium, "iptables flush", r"(?i)\biptables\s+-F\b", false),
    (RiskLevel::Medium, "user deletion", r"(?i)\buserdel\b", false),
    (RiskLevel::Medium, "chmod 777", r"(?i)\bchmod\s+777\b", false),
];

/// The built-in rule set
pub fn default_risk_rules() -> Vec<RiskRule> {
    DEFAULT_RULES
        .iter()
        .filter_map(|(level, reason, pattern, allow)| {
            let rule = if *allow {
                RiskRule::allow(*reason, pattern)
            } else {
                RiskRule::deny(*level, *reason, pattern)
            };
            match rule {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("skipping built-in risk rule: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Result of a risk scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Reasons of every deny rule that matched
    pub notes: Vec<String>,
}

/// Evaluates a rule set against document text
#[derive(Debug, Clone)]
pub struct RiskEvaluator {
    rules: Vec<RiskRule>,
}

impl RiskEvaluator {
    pub fn new(rules: Vec<RiskRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RiskRule] {
        &self.rules
    }

    /// Scan `text`; the level is the maximum severity matched, `low` if none
    pub fn evaluate(&self, text: &str) -> RiskAssessment {
        let allow: Vec<&RiskRule> = self.rules.iter().filter(|r| r.allow).collect();

        let filtered = if allow.is_empty() {
            text.to_string()
        } else {
            text.split('\n')
                .map(|line| {
                    allow.iter().fold(line.to_string(), |acc, rule| {
                        rule.pattern.replace_all(&acc, "").into_owned()
                    })
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut assessment = RiskAssessment::default();
        for rule in self.rules.iter().filter(|r| !r.allow) {
            if rule.pattern.is_match(&filtered) {
                assessment.notes.push(rule.reason.clone());
                assessment.level = assessment.level.max(rule.level);
            }
        }
        debug!(
            "risk scan: level={} notes={}",
            assessment.level,
            assessment.notes.len()
        );
        assessment
    }
}

impl Default for RiskEvaluator {
    fn default() -> Self {
        Self::new(default_risk_rules())
    }
}
