//! Shared draft state for multi-agent runs
//!
//! The store is the single serialization point for a draft: every mutation
//! takes the write lock, and [`DraftStore::snapshot`] hands out a deep copy
//! so a caller assembling a document never sees a half-applied update.

use chrono::{DateTime, Utc};
use flowsmith_core::StepStatus;
use flowsmith_planning::{PlanStep, ReviewResult, StepPatch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

pub const DEFAULT_DRAFT_ID: &str = "draft";

pub const METRIC_STEPS_UPDATED: &str = "steps_updated";
pub const METRIC_REVIEWS: &str = "reviews";
pub const METRIC_REVIEW_FAILED: &str = "review_failed";
pub const METRIC_REVIEW_RETRIES: &str = "review_retries";
pub const METRIC_REVIEW_DURATION_MS: &str = "review_duration_ms";
pub const METRIC_VALIDATION_RETRIES: &str = "validation_retries";
pub const METRIC_VALIDATION_DURATION_MS: &str = "validation_duration_ms";

/// In-progress state of one multi-agent run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub draft_id: String,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    /// Latest accepted patch per plan step id
    #[serde(default)]
    pub steps: BTreeMap<String, StepPatch>,
    #[serde(default)]
    pub reviews: BTreeMap<String, ReviewResult>,
    #[serde(default)]
    pub metrics: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_yaml: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Draft {
    fn new(draft_id: &str, base_yaml: &str) -> Self {
        Self {
            draft_id: draft_id.to_string(),
            base_yaml: base_yaml.trim().to_string(),
            updated_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    fn bump(&mut self, key: &str, delta: i64) {
        *self.metrics.entry(key.to_string()).or_insert(0) += delta;
    }

    pub fn metric(&self, key: &str) -> i64 {
        self.metrics.get(key).copied().unwrap_or(0)
    }

    /// Patches in plan order, skipping steps without one
    pub fn ordered_patches(&self) -> Vec<&StepPatch> {
        self.plan
            .iter()
            .filter_map(|step| self.steps.get(&step.id))
            .collect()
    }
}

fn draft_key(draft_id: &str) -> String {
    match draft_id.trim() {
        "" => DEFAULT_DRAFT_ID.to_string(),
        id => id.to_string(),
    }
}

/// Thread-safe map of drafts keyed by draft id
///
/// Drafts are created on first reference, by [`DraftStore::get_or_create`]
/// or by any mutator, and are never removed.
#[derive(Default)]
pub struct DraftStore {
    drafts: RwLock<HashMap<String, Draft>>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, draft_id: &str, f: F)
    where
        F: FnOnce(&mut Draft),
    {
        let key = draft_key(draft_id);
        let mut drafts = self.drafts.write().unwrap_or_else(|e| e.into_inner());
        let draft = drafts
            .entry(key.clone())
            .or_insert_with(|| Draft::new(&key, ""));
        f(draft);
        draft.touch();
    }

    /// The draft's current snapshot, creating it with `base_yaml` if new
    ///
    /// `base_yaml` is ignored for a draft that already exists.
    pub fn get_or_create(&self, draft_id: &str, base_yaml: &str) -> Draft {
        let key = draft_key(draft_id);
        let mut drafts = self.drafts.write().unwrap_or_else(|e| e.into_inner());
        drafts
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Creating draft {}", key);
                Draft::new(&key, base_yaml)
            })
            .clone()
    }

    pub fn contains(&self, draft_id: &str) -> bool {
        let drafts = self.drafts.read().unwrap_or_else(|e| e.into_inner());
        drafts.contains_key(&draft_key(draft_id))
    }

    /// Replace a draft wholesale (used when resuming from a checkpoint)
    pub fn restore(&self, draft: Draft) {
        let key = draft_key(&draft.draft_id);
        let mut drafts = self.drafts.write().unwrap_or_else(|e| e.into_inner());
        drafts.insert(
            key.clone(),
            Draft {
                draft_id: key,
                ..draft
            },
        );
    }

    pub fn update_plan(&self, draft_id: &str, plan: &[PlanStep]) {
        self.mutate(draft_id, |draft| draft.plan = plan.to_vec());
    }

    pub fn set_step_status(&self, draft_id: &str, step_id: &str, status: StepStatus) {
        self.mutate(draft_id, |draft| {
            if let Some(step) = draft.plan.iter_mut().find(|s| s.id == step_id) {
                step.status = status;
            }
        });
    }

    pub fn update_step(&self, draft_id: &str, patch: &StepPatch) {
        self.mutate(draft_id, |draft| {
            draft.steps.insert(patch.step_id.clone(), patch.clone());
            draft.bump(METRIC_STEPS_UPDATED, 1);
        });
    }

    pub fn update_review(&self, draft_id: &str, result: &ReviewResult) {
        self.mutate(draft_id, |draft| {
            draft.reviews.insert(result.step_id.clone(), result.clone());
            draft.bump(METRIC_REVIEWS, 1);
            if result.status == StepStatus::Failed {
                draft.bump(METRIC_REVIEW_FAILED, 1);
            }
        });
    }

    /// Add `delta` to a metric; a zero delta is a no-op
    pub fn add_metric(&self, draft_id: &str, key: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        self.mutate(draft_id, |draft| draft.bump(key, delta));
    }

    /// Deep copy of a draft; an unknown id yields an empty draft
    pub fn snapshot(&self, draft_id: &str) -> Draft {
        let drafts = self.drafts.read().unwrap_or_else(|e| e.into_inner());
        drafts.get(&draft_key(draft_id)).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsmith_planning::PatchSource;
    use serde_json::json;
    use std::sync::Arc;

    fn plan() -> Vec<PlanStep> {
        let mut plan = vec![PlanStep::new("install nginx"), PlanStep::new("start nginx")];
        flowsmith_planning::assign_plan_ids(&mut plan);
        plan
    }

    #[test]
    fn test_get_or_create_defaults() {
        let store = DraftStore::new();
        let draft = store.get_or_create("  ", "  version: v0.1\n");
        assert_eq!(draft.draft_id, DEFAULT_DRAFT_ID);
        assert_eq!(draft.base_yaml, "version: v0.1");

        let again = store.get_or_create("", "other");
        assert_eq!(again.base_yaml, "version: v0.1");
    }

    #[test]
    fn test_mutators_create_lazily() {
        let store = DraftStore::new();
        store.add_metric("d1", METRIC_VALIDATION_RETRIES, 2);
        assert!(store.contains("d1"));
        assert_eq!(store.snapshot("d1").metric(METRIC_VALIDATION_RETRIES), 2);
    }

    #[test]
    fn test_update_step_and_review_metrics() {
        let store = DraftStore::new();
        let plan = plan();
        store.update_plan("d1", &plan);

        let patch = StepPatch::new("install nginx", "cmd.run")
            .with_param("cmd", json!("apt-get install -y nginx"))
            .with_source(PatchSource::Coder);
        let patch = StepPatch {
            step_id: plan[0].id.clone(),
            ..patch
        };
        store.update_step("d1", &patch);
        store.update_review(
            "d1",
            &ReviewResult {
                step_id: plan[0].id.clone(),
                status: StepStatus::Failed,
                ..Default::default()
            },
        );
        store.add_metric("d1", "noop", 0);

        let draft = store.snapshot("d1");
        assert_eq!(draft.metric(METRIC_STEPS_UPDATED), 1);
        assert_eq!(draft.metric(METRIC_REVIEWS), 1);
        assert_eq!(draft.metric(METRIC_REVIEW_FAILED), 1);
        assert!(!draft.metrics.contains_key("noop"));
        assert_eq!(draft.ordered_patches().len(), 1);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let store = DraftStore::new();
        store.update_plan("d1", &plan());
        let mut snapshot = store.snapshot("d1");
        snapshot.plan.clear();
        snapshot.metrics.insert("x".to_string(), 1);

        let fresh = store.snapshot("d1");
        assert_eq!(fresh.plan.len(), 2);
        assert!(!fresh.metrics.contains_key("x"));
        assert_eq!(store.snapshot("missing"), Draft::default());
    }

    #[test]
    fn test_set_step_status() {
        let store = DraftStore::new();
        let plan = plan();
        store.update_plan("d1", &plan);
        store.set_step_status("d1", &plan[1].id, StepStatus::Done);
        assert_eq!(store.snapshot("d1").plan[1].status, StepStatus::Done);
    }

    #[test]
    fn test_concurrent_metric_updates() {
        let store = Arc::new(DraftStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.add_metric("d1", METRIC_REVIEW_RETRIES, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.snapshot("d1").metric(METRIC_REVIEW_RETRIES), 800);
    }
}
