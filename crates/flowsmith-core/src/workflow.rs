//! Declarative workflow document model
//!
//! The document is the artifact the whole engine exists to produce: a
//! version/name header, an inventory of hosts and groups, an execution plan
//! and an ordered list of steps. Maps are ordered so that serializing the same
//! document twice yields byte-identical text.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_WORKFLOW_VERSION: &str = "v0.1";
pub const DEFAULT_WORKFLOW_NAME: &str = "draft-workflow";
pub const DEFAULT_PLAN_MODE: &str = "manual-approve";
pub const DEFAULT_PLAN_STRATEGY: &str = "sequential";

type Params = BTreeMap<String, serde_json::Value>;

/// A complete workflow document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub inventory: Inventory,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: Params,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<Handler>,
}

/// Named hosts and groups a workflow may target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, Host>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Group>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: Params,
}

impl Inventory {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.groups.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: Params,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: Params,
}

/// Execution plan: `manual-approve` or `auto`, always `sequential`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub strategy: String,
}

/// One host-targeted operational step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default, alias = "args", skip_serializing_if = "BTreeMap::is_empty")]
    pub with: Params,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when: String,
    #[serde(default, rename = "loop", skip_serializing_if = "Vec::is_empty")]
    pub loop_items: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
}

/// Handler triggered by a step's notify list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, alias = "args", skip_serializing_if = "BTreeMap::is_empty")]
    pub with: Params,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Workflow {
    /// Parse a document from YAML (JSON is accepted as a YAML subset)
    pub fn load(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Serialize to trimmed YAML text
    pub fn to_yaml(&self) -> Result<String> {
        let text = serde_yaml::to_string(self)?;
        Ok(text.trim().to_string())
    }

    /// Structural validation of the document grammar
    ///
    /// Returns a sorted list of issues; an empty list means the document is
    /// well-formed.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.version.trim().is_empty() {
            issues.push("version is required".to_string());
        }
        if self.name.trim().is_empty() {
            issues.push("name is required".to_string());
        }
        if self.steps.is_empty() {
            issues.push("steps must not be empty".to_string());
        }

        let mode = self.plan.mode.trim();
        if !mode.is_empty() && mode != "manual-approve" && mode != "auto" {
            issues.push(format!(
                "plan.mode must be manual-approve or auto, got {:?}",
                self.plan.mode
            ));
        }
        let strategy = self.plan.strategy.trim();
        if !strategy.is_empty() && strategy != DEFAULT_PLAN_STRATEGY {
            issues.push(format!(
                "plan.strategy must be sequential, got {:?}",
                self.plan.strategy
            ));
        }

        let mut handler_names = HashSet::new();
        for handler in &self.handlers {
            if handler.name.trim().is_empty() {
                issues.push("handler name is required".to_string());
                continue;
            }
            if !handler_names.insert(handler.name.as_str()) {
                issues.push(format!("handler name {:?} is duplicated", handler.name));
            }
            if handler.action.trim().is_empty() {
                issues.push(format!("handler {:?} action is required", handler.name));
            }
        }

        let mut step_names = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            let label = format!("steps[{}]", i);
            if step.name.trim().is_empty() {
                issues.push(format!("{} name is required", label));
            } else if !step_names.insert(step.name.as_str()) {
                issues.push(format!("step name {:?} is duplicated", step.name));
            }
            if step.action.trim().is_empty() {
                issues.push(format!("{} action is required", label));
            }
            for notify in &step.notify {
                if !handler_names.contains(notify.as_str()) {
                    issues.push(format!("{} notify handler {:?} not found", label, notify));
                }
            }
        }

        issues.sort();
        issues
    }

    /// Every host named directly or through a group, sorted
    pub fn host_names(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .inventory
            .hosts
            .keys()
            .chain(self.inventory.groups.values().flat_map(|g| g.hosts.iter()))
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

/// Count step entries in document text without parsing it
pub fn count_steps(text: &str) -> usize {
    text.lines()
        .filter(|line| line.trim_start().starts_with("- name:"))
        .count()
}
