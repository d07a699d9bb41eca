//! Multi-agent synthesis: coordinator plan, coder patches, reviewer checks
//!
//! The coordinator decomposes the request into plan steps. For each step a
//! coder proposes a [`StepPatch`] and a reviewer repairs it until it passes
//! structural checks and, when an environment is configured, a single-step
//! execution check. Patches accumulate in the shared [`DraftStore`]; the
//! final document is assembled from them in plan order.
//!
//! A run can stop after a named step and leave a checkpoint behind; resuming
//! from it restores the draft and skips the coordinator.

use flowsmith_agent::ChatReply;
use flowsmith_core::{
    count_steps, merge_questions, Event, EventStatus, FlowError, Mode, Result, StepStatus,
    Workflow,
};
use flowsmith_planning::{
    align_step_patch, assign_plan_ids, build_coder_prompt, build_coordinator_prompt,
    build_reviewer_prompt, fallback_plan, parse_coordinator_reply, parse_step_patch,
    questions_from_missing, should_ask_questions, validate_step_patch, CoordinatorOutcome,
    PatchSource, PlanStep, ReviewResult, StepPatch,
};
use flowsmith_validation::{merge_steps_into_base, steps_only_yaml};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::draft_store::{
    Draft, METRIC_REVIEW_DURATION_MS, METRIC_REVIEW_RETRIES, METRIC_VALIDATION_DURATION_MS,
    METRIC_VALIDATION_RETRIES,
};
use crate::lanes::until_cancelled;
use crate::pipeline::Pipeline;
use crate::state::{AgentIdentity, Emitter, RunError, RunOptions, RunResult, SynthesisState};

/// What a paused run leaves in the checkpoint store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiCheckpoint {
    pub draft: Draft,
    /// First plan step still to run
    pub next_index: usize,
    #[serde(default)]
    pub prompt: String,
}

fn event(name: &str, status: EventStatus) -> Event {
    Event::new(name, status).with_event_type(name)
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Assemble a document from the draft's patches in plan order
///
/// The steps are normalized on their own, then merged into the draft's base
/// document so its header, inventory and plan survive.
fn assemble_draft_yaml(pipeline: &Pipeline, draft: &Draft) -> String {
    let wf = Workflow {
        steps: draft.ordered_patches().iter().map(|p| p.to_step()).collect(),
        ..Default::default()
    };
    let Ok(text) = wf.to_yaml() else {
        return String::new();
    };
    let normalized = pipeline.normalizer().normalize(&text);
    merge_steps_into_base(&draft.base_yaml, &steps_only_yaml(&normalized.yaml))
}

struct MultiRun<'a> {
    pipeline: &'a Pipeline,
    opts: &'a RunOptions,
    state: SynthesisState,
    draft_id: String,
    coordinator: Emitter,
    coder: Emitter,
    reviewer: Emitter,
}

impl<'a> MultiRun<'a> {
    fn new(pipeline: &'a Pipeline, opts: &'a RunOptions, state: SynthesisState) -> Self {
        let draft_id = [opts.draft_id.trim(), opts.session_key.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "draft-{}",
                    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
                )
            });
        let base = Emitter::new(opts.event_sink.clone());
        Self {
            pipeline,
            opts,
            state,
            draft_id,
            coordinator: base.with_agent(AgentIdentity::new("Coordinator", "coordinator")),
            coder: base.with_agent(AgentIdentity::new("Coder", "coder")),
            reviewer: base.with_agent(AgentIdentity::new("Reviewer", "reviewer")),
        }
    }

    /// One model call admitted through the global lane
    async fn ask(&self, prompt: String) -> Result<ChatReply> {
        let pipeline = self.pipeline;
        let system_prompt = self.state.system_prompt.as_str();
        let opts = self.opts;
        pipeline
            .global_lane()
            .run(&opts.cancel, || pipeline.chat(opts, system_prompt, prompt))
            .await
    }

    fn draft(&self) -> Draft {
        self.pipeline.drafts().snapshot(&self.draft_id)
    }

    fn draft_yaml(&self) -> String {
        assemble_draft_yaml(self.pipeline, &self.draft())
    }

    async fn execute(&mut self) -> Result<()> {
        let resume_id = self.opts.resume_checkpoint_id.trim().to_string();
        let (plan, start) = if resume_id.is_empty() {
            self.pipeline
                .drafts()
                .get_or_create(&self.draft_id, &self.state.base_yaml);
            let outcome = self.coordinate().await?;
            if !outcome.missing.is_empty()
                && should_ask_questions(
                    &self.state.prompt,
                    &self.pipeline.config().multi_agent.question_phrases,
                )
            {
                self.ask_questions(outcome);
                return Ok(());
            }
            (self.publish_plan(outcome.plan), 0)
        } else {
            self.resume(&resume_id)?
        };
        self.state.draft_id = self.draft_id.clone();

        for index in start..plan.len() {
            if self.opts.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            self.run_step(&plan, index).await?;

            let pause_at = self.opts.pause_after_step.trim();
            let step = &plan[index];
            if !pause_at.is_empty()
                && (step.id == pause_at || step.step_name.eq_ignore_ascii_case(pause_at))
                && index + 1 < plan.len()
            {
                return self.pause(index + 1);
            }
        }

        self.coordinator
            .emit(event("coder_done", EventStatus::Done).with_message(format!("{} steps", plan.len())));
        self.finalize().await
    }

    async fn coordinate(&mut self) -> Result<CoordinatorOutcome> {
        self.coordinator.emit(event("coordinator", EventStatus::Start));
        let prompt = build_coordinator_prompt(&self.state.prompt, &self.state.context);
        let outcome = match self.ask(prompt).await {
            Ok(reply) => {
                self.state.thought = reply.thought.trim().to_string();
                parse_coordinator_reply(&reply.content)
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.coordinator.emit(
                    event("coordinator_error", EventStatus::Error).with_message(e.to_string()),
                );
                Err(e)
            }
        }
    }

    fn publish_plan(&mut self, plan: Vec<PlanStep>) -> Vec<PlanStep> {
        let mut plan = if plan.is_empty() {
            fallback_plan(&self.state.prompt)
        } else {
            plan
        };
        assign_plan_ids(&mut plan);
        self.pipeline.drafts().update_plan(&self.draft_id, &plan);
        self.state.plan = plan.clone();
        info!("draft {} plan has {} steps", self.draft_id, plan.len());
        self.coordinator.emit(
            event("plan_ready", EventStatus::Done)
                .with_message(format!("{} steps", plan.len()))
                .with_data(json!({ "plan": plan })),
        );
        plan
    }

    fn ask_questions(&mut self, outcome: CoordinatorOutcome) {
        let plan = self.publish_plan(outcome.plan);
        for step in &plan {
            self.coordinator.emit(
                event("plan_step_start", EventStatus::Start)
                    .with_parent_step(&step.id)
                    .with_display_name(&step.step_name),
            );
            self.coordinator.emit(
                event("plan_step_done", EventStatus::Done)
                    .with_parent_step(&step.id)
                    .with_display_name(&step.step_name),
            );
        }
        let questions = questions_from_missing(&outcome.missing);
        self.state.questions = merge_questions(&self.state.questions, &questions);
        self.state.draft_id = self.draft_id.clone();
        self.state.summary = "awaiting missing inputs".to_string();
        self.state.needs_review = true;
        self.coordinator.emit(
            event("question_gate", EventStatus::Done)
                .with_message("awaiting missing inputs")
                .with_data(json!({ "questions": self.state.questions })),
        );
    }

    fn resume(&mut self, checkpoint_id: &str) -> Result<(Vec<PlanStep>, usize)> {
        let bytes = self.pipeline.checkpoints().get(checkpoint_id).ok_or_else(|| {
            FlowError::InvalidInput(format!("checkpoint {} not found", checkpoint_id))
        })?;
        let checkpoint: MultiCheckpoint = serde_json::from_slice(&bytes)?;
        self.draft_id = checkpoint.draft.draft_id.clone();
        if self.state.prompt.is_empty() {
            self.state.prompt = checkpoint.prompt.clone();
        }
        if self.state.base_yaml.is_empty() {
            self.state.base_yaml = checkpoint.draft.base_yaml.clone();
        }
        let plan = checkpoint.draft.plan.clone();
        self.pipeline.drafts().restore(checkpoint.draft);
        self.state.plan = plan.clone();
        debug!(
            "resuming draft {} at step {}",
            self.draft_id, checkpoint.next_index
        );
        self.coordinator.emit(
            event("checkpoint_resumed", EventStatus::Done)
                .with_message(checkpoint_id)
                .with_data(json!({ "next_index": checkpoint.next_index })),
        );
        Ok((plan, checkpoint.next_index))
    }

    fn pause(&mut self, next_index: usize) -> Result<()> {
        let checkpoint_id = match self.opts.checkpoint_id.trim() {
            "" => self.draft_id.clone(),
            id => id.to_string(),
        };
        let draft = self.draft();
        let payload = MultiCheckpoint {
            draft: draft.clone(),
            next_index,
            prompt: self.state.prompt.clone(),
        };
        self.pipeline
            .checkpoints()
            .set(&checkpoint_id, &serde_json::to_vec(&payload)?);

        self.state.paused = true;
        self.state.plan = draft.plan.clone();
        self.state.yaml = assemble_draft_yaml(self.pipeline, &draft);
        self.state.needs_review = true;
        self.state.summary = format!("paused after step {} of {}", next_index, draft.plan.len());
        info!("draft {} paused into checkpoint {}", self.draft_id, checkpoint_id);
        self.coordinator.emit(
            event("checkpoint_saved", EventStatus::Done)
                .with_message(checkpoint_id.clone())
                .with_data(json!({ "checkpoint_id": checkpoint_id, "next_index": next_index })),
        );
        Ok(())
    }

    async fn run_step(&mut self, plan: &[PlanStep], index: usize) -> Result<()> {
        let step = &plan[index];
        let drafts = self.pipeline.drafts().clone();
        drafts.set_step_status(&self.draft_id, &step.id, StepStatus::InProgress);
        self.coordinator.emit(
            event("plan_step_start", EventStatus::Start)
                .with_parent_step(&step.id)
                .with_display_name(&step.step_name),
        );

        let prompt = build_coder_prompt(step, &self.state.context);
        let patch = match self.ask(prompt).await {
            Ok(reply) => parse_step_patch(&reply.content),
            Err(e) => Err(e),
        };
        let mut patch = match patch {
            Ok(patch) => patch,
            Err(e) => {
                drafts.set_step_status(&self.draft_id, &step.id, StepStatus::Failed);
                self.coder.emit(
                    event("step_patch_created", EventStatus::Error)
                        .with_parent_step(&step.id)
                        .with_message(e.to_string()),
                );
                return Err(e);
            }
        };

        if !plan.iter().any(|s| s.id == patch.step_id) {
            patch.step_id = step.id.clone();
        }
        let patch = align_step_patch(plan, patch).with_source(PatchSource::Coder);
        drafts.update_step(&self.draft_id, &patch);
        self.coder.emit(
            event("step_patch_created", EventStatus::Done)
                .with_parent_step(&step.id)
                .with_message(patch.summary.clone())
                .with_data(json!({ "step_patch": patch, "yaml": self.draft_yaml() })),
        );

        let review = self.review_step(plan, step, patch).await?;
        if review.passed() {
            drafts.set_step_status(&self.draft_id, &step.id, StepStatus::Done);
            self.coordinator.emit(
                event("plan_step_done", EventStatus::Done)
                    .with_parent_step(&step.id)
                    .with_display_name(&step.step_name),
            );
        } else {
            drafts.set_step_status(&self.draft_id, &step.id, StepStatus::Failed);
            self.coordinator.emit(
                event("plan_step_done", EventStatus::Error)
                    .with_parent_step(&step.id)
                    .with_display_name(&step.step_name)
                    .with_message(review.issues.join("; ")),
            );
        }
        Ok(())
    }

    async fn reviewer_fix(
        &self,
        plan: &[PlanStep],
        patch: &StepPatch,
        issues: &[String],
        exec_error: &str,
    ) -> Result<StepPatch> {
        let prompt = build_reviewer_prompt(patch, issues, exec_error);
        let reply = self.ask(prompt).await?;
        let mut fixed = parse_step_patch(&reply.content)?;
        if !plan.iter().any(|s| s.id == fixed.step_id) {
            fixed.step_id = patch.step_id.clone();
        }
        Ok(fixed.with_source(PatchSource::Reviewer))
    }

    /// Execute a one-step document built from `patch`; returns the failures
    ///
    /// The execution holds a global lane slot like any model call.
    async fn run_step_validation(&self, patch: &StepPatch) -> Result<Vec<String>> {
        let (Some(runner), Some(env)) = (self.pipeline.runner(), self.state.env.as_ref()) else {
            return Ok(Vec::new());
        };
        let wf = Workflow {
            steps: vec![patch.to_step()],
            ..Default::default()
        };
        let text = merge_steps_into_base(&self.state.base_yaml, &wf.to_yaml()?);
        let yaml = self.pipeline.normalizer().normalize(&text).yaml;

        let cancel = &self.opts.cancel;
        let outcome = self
            .pipeline
            .global_lane()
            .run(cancel, || until_cancelled(cancel, runner.run(env, &yaml)))
            .await;
        match outcome {
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => Ok(vec![e.to_string()]),
            Ok(result) if result.is_success() => Ok(Vec::new()),
            Ok(result) => Ok(vec![match result.stderr.trim() {
                "" => "validation failed".to_string(),
                stderr => stderr.to_string(),
            }]),
        }
    }

    async fn review_step(
        &mut self,
        plan: &[PlanStep],
        step: &PlanStep,
        patch: StepPatch,
    ) -> Result<ReviewResult> {
        let started = Instant::now();
        let drafts = self.pipeline.drafts().clone();
        self.reviewer
            .emit(event("review_start", EventStatus::Start).with_parent_step(&step.id));

        let mut patch = patch;
        let mut attempts = 0;
        let mut error = String::new();
        let mut issues = validate_step_patch(&patch);

        if !issues.is_empty() {
            attempts += 1;
            match self.reviewer_fix(plan, &patch, &issues, "").await {
                Ok(fixed) => {
                    patch = fixed;
                    issues = validate_step_patch(&patch);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("reviewer fix failed for {}: {}", step.id, e);
                    error = e.to_string();
                }
            }
            self.reviewer.emit(
                event("review_update", EventStatus::Done)
                    .with_parent_step(&step.id)
                    .with_data(json!({ "issues": issues, "step_patch": patch })),
            );
        }

        let can_execute = self.state.env.is_some()
            && !self.state.skip_execute
            && self.pipeline.runner().is_some();
        if issues.is_empty() && can_execute {
            self.reviewer
                .emit(event("validation_start", EventStatus::Start).with_parent_step(&step.id));
            let validation_started = Instant::now();
            issues = self.run_step_validation(&patch).await?;
            drafts.add_metric(
                &self.draft_id,
                METRIC_VALIDATION_DURATION_MS,
                elapsed_ms(validation_started),
            );
            let status = if issues.is_empty() {
                EventStatus::Done
            } else {
                EventStatus::Error
            };
            self.reviewer.emit(
                event("validation_done", status)
                    .with_parent_step(&step.id)
                    .with_data(json!({ "issues": issues })),
            );

            let max_retries = self.pipeline.config().multi_agent.reviewer_retries;
            let mut retries = 0;
            while !issues.is_empty() && retries < max_retries {
                retries += 1;
                attempts += 1;
                drafts.add_metric(&self.draft_id, METRIC_VALIDATION_RETRIES, 1);
                drafts.add_metric(&self.draft_id, METRIC_REVIEW_RETRIES, 1);

                let exec_error = issues.join("; ");
                match self.reviewer_fix(plan, &patch, &[], &exec_error).await {
                    Ok(fixed) => patch = fixed,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!("reviewer retry failed for {}: {}", step.id, e);
                        error = e.to_string();
                        break;
                    }
                }
                issues = validate_step_patch(&patch);
                if issues.is_empty() {
                    let validation_started = Instant::now();
                    issues = self.run_step_validation(&patch).await?;
                    drafts.add_metric(
                        &self.draft_id,
                        METRIC_VALIDATION_DURATION_MS,
                        elapsed_ms(validation_started),
                    );
                }
            }
        }

        let patch = align_step_patch(plan, patch);
        drafts.update_step(&self.draft_id, &patch);
        let result = ReviewResult {
            step_id: patch.step_id.clone(),
            status: if issues.is_empty() {
                StepStatus::Done
            } else {
                StepStatus::Failed
            },
            summary: patch.summary.clone(),
            issues: issues.clone(),
            attempts,
            error,
        };
        drafts.update_review(&self.draft_id, &result);
        drafts.add_metric(&self.draft_id, METRIC_REVIEW_DURATION_MS, elapsed_ms(started));

        let status = if result.passed() {
            EventStatus::Done
        } else {
            EventStatus::Error
        };
        self.reviewer.emit(
            event("review_done", status)
                .with_parent_step(&step.id)
                .with_message(format!("attempts={}", attempts))
                .with_data(json!({
                    "issues": issues,
                    "step_patch": patch,
                    "yaml": self.draft_yaml(),
                })),
        );
        Ok(result)
    }

    fn apply_outcome(&mut self, yaml: &str) {
        let outcome = self.pipeline.normalizer().normalize(yaml);
        self.state.yaml = outcome.yaml;
        self.state.issues = outcome.issues;
        self.state.notices = merge_questions(&self.state.notices, &outcome.notices);
        self.state.risk_level = outcome.risk.level;
        self.state.risk_notes = outcome.risk.notes;
    }

    async fn finalize(&mut self) -> Result<()> {
        let draft = self.draft();
        self.state.plan = draft.plan.clone();
        let assembled = assemble_draft_yaml(self.pipeline, &draft);
        self.apply_outcome(&assembled);

        if !self.state.issues.is_empty() {
            info!(
                "draft {} has {} issues, running a fix pass",
                self.draft_id,
                self.state.issues.len()
            );
            let fix_opts = RunOptions {
                max_retries: Some(1),
                skip_execute: true,
                ..self.opts.clone()
            };
            match self
                .pipeline
                .run_fix(&self.state.yaml, &self.state.issues, &fix_opts)
                .await
            {
                Ok(fixed) => {
                    self.state.history.push(self.state.yaml.clone());
                    self.apply_outcome(&fixed.yaml);
                    self.state.retry_count += fixed.retry_count;
                }
                Err(e) if e.is_cancelled() => return Err(e.error),
                Err(e) => {
                    warn!("final fix pass failed: {}", e);
                    self.state.last_error = e.to_string();
                }
            }
        }

        if !self.state.issues.is_empty() {
            self.coordinator.emit(
                event("finalize_failed", EventStatus::Error)
                    .with_message(self.state.issues.join("; "))
                    .with_data(json!({ "issues": self.state.issues })),
            );
            self.state.is_success = false;
            self.state.needs_review = true;
            return Err(FlowError::ValidationFailed(self.state.issues.join("; ")));
        }

        self.state.is_success = true;
        self.state.execution_skipped =
            self.state.env.is_none() || self.state.skip_execute || self.pipeline.runner().is_none();
        self.state.needs_review = self.state.review_required();
        self.state.summary = format!(
            "steps={} risk={} issues={}",
            count_steps(&self.state.yaml),
            self.state.risk_level,
            self.state.issues.len()
        );
        self.coordinator.emit(
            event("finalize_success", EventStatus::Done)
                .with_message(self.state.summary.clone())
                .with_data(json!({ "yaml": self.state.yaml })),
        );
        Ok(())
    }
}

impl Pipeline {
    /// Coordinator / coder / reviewer synthesis over a shared draft
    ///
    /// Runs sharing a session key (or draft id) are admitted one at a time.
    #[instrument(skip(self, prompt, opts), fields(draft = %opts.draft_id))]
    pub async fn run_multi_create(&self, prompt: &str, opts: &RunOptions) -> RunResult {
        let state = self.new_state(Mode::Generate, prompt, opts);
        if let Err(e) = self.client() {
            return Err(RunError::new(e, state));
        }
        if state.prompt.is_empty() && opts.resume_checkpoint_id.trim().is_empty() {
            return Err(RunError::new(
                FlowError::InvalidInput("prompt is required".to_string()),
                state,
            ));
        }

        let key = [opts.session_key.trim(), opts.draft_id.trim()]
            .into_iter()
            .find(|k| !k.is_empty())
            .unwrap_or_default()
            .to_string();
        let fallback = state.clone();
        let admitted = self
            .session_lane()
            .run(&opts.cancel, &key, || async move {
                let mut run = MultiRun::new(self, opts, state);
                let outcome = run.execute().await;
                Ok(match outcome {
                    Ok(()) => Ok(run.state),
                    Err(e) => {
                        run.state.draft_id = run.draft_id.clone();
                        Err(RunError::new(e, run.state))
                    }
                })
            })
            .await;

        match admitted {
            Ok(result) => result,
            Err(e) => Err(RunError::new(e, fallback)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft_store::{METRIC_REVIEWS, METRIC_STEPS_UPDATED};
    use crate::lanes::GlobalLane;
    use crate::pipeline::tests::collecting_sink;
    use flowsmith_agent::{MockChatClient, MockRunner, ValidationRunner};
    use flowsmith_core::{ExecutionResult, FlowConfig, RiskLevel, ValidationEnv};
    use std::sync::Arc;

    const ONE_STEP_PLAN: &str =
        r#"{"plan":[{"step_name":"install nginx","description":"install the package"}],"missing":[]}"#;
    const TWO_STEP_PLAN: &str = r#"{"plan":[{"step_name":"install nginx"},{"step_name":"start nginx"}],"missing":[]}"#;
    const INSTALL_PATCH: &str =
        r#"{"step_name":"install nginx","action":"cmd.run","with":{"cmd":"apt-get install -y nginx"}}"#;
    const START_PATCH: &str =
        r#"{"step_name":"start nginx","action":"cmd.run","with":{"cmd":"systemctl start nginx"}}"#;

    fn pipeline(client: Arc<MockChatClient>) -> Pipeline {
        Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client)
    }

    #[tokio::test]
    async fn test_single_step_plan() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(ONE_STEP_PLAN)
                .with_reply(INSTALL_PATCH),
        );
        let (sink, events) = collecting_sink();
        let p = pipeline(client.clone());
        let opts = RunOptions::new().with_draft_id("d1").with_event_sink(sink);
        let state = p.run_multi_create("install nginx", &opts).await.unwrap();

        assert!(state.issues.is_empty(), "{:?}", state.issues);
        assert_eq!(state.risk_level, RiskLevel::Low);
        assert!(state.is_success);
        assert!(!state.needs_review);
        assert_eq!(state.draft_id, "d1");
        assert!(state.yaml.contains("apt-get install -y nginx"));
        assert_eq!(state.plan[0].status, StepStatus::Done);

        let draft = p.drafts().snapshot("d1");
        assert_eq!(draft.metric(METRIC_STEPS_UPDATED), 2);
        assert_eq!(draft.metric(METRIC_REVIEWS), 1);
        assert_eq!(client.calls().len(), 2);

        let names: Vec<String> = events.lock().unwrap().iter().map(|e| e.node.clone()).collect();
        for expected in [
            "plan_ready",
            "plan_step_start",
            "step_patch_created",
            "review_start",
            "review_done",
            "plan_step_done",
            "coder_done",
            "finalize_success",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
        let events = events.lock().unwrap();
        let created = events.iter().find(|e| e.node == "step_patch_created").unwrap();
        assert_eq!(created.agent_role, "coder");
        assert_eq!(created.parent_step_id, "step-1-install-nginx");
    }

    #[tokio::test]
    async fn test_questions_stop_before_execution() {
        let client = Arc::new(
            MockChatClient::new().with_reply(r#"{"plan":[],"missing":["hosts"]}"#),
        );
        let p = pipeline(client.clone());
        let state = p
            .run_multi_create("install nginx, ask me what info you need", &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(
            state.questions,
            vec!["Which hosts or groups should this run on?".to_string()]
        );
        assert_eq!(state.plan.len(), 1);
        assert!(state.needs_review);
        assert!(state.yaml.is_empty());
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_without_request_uses_fallback_plan() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(r#"{"plan":[],"missing":["hosts"]}"#)
                .with_reply(INSTALL_PATCH),
        );
        let state = pipeline(client)
            .run_multi_create("install nginx", &RunOptions::new())
            .await
            .unwrap();
        assert!(state.questions.is_empty());
        assert_eq!(state.plan.len(), 1);
        assert!(state.is_success);
    }

    #[tokio::test]
    async fn test_coder_failure_marks_step() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(ONE_STEP_PLAN)
                .with_reply("I cannot do that"),
        );
        let p = pipeline(client);
        let err = p
            .run_multi_create("install nginx", &RunOptions::new().with_draft_id("d-err"))
            .await
            .unwrap_err();
        assert!(matches!(err.error, FlowError::Parse(_)));
        assert_eq!(err.state.draft_id, "d-err");
        assert_eq!(
            p.drafts().snapshot("d-err").plan[0].status,
            StepStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_reviewer_repairs_failed_execution() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(ONE_STEP_PLAN)
                .with_reply(
                    r#"{"step_name":"install nginx","action":"cmd.run","with":{"cmd":"apt install ngnix"}}"#,
                )
                .with_reply(INSTALL_PATCH),
        );
        let runner = Arc::new(
            MockRunner::new()
                .with_result(ExecutionResult::failure("E: Unable to locate package ngnix", 100)),
        );
        let p = pipeline(client.clone()).with_runner(runner.clone());
        let opts = RunOptions::new()
            .with_draft_id("d2")
            .with_env(ValidationEnv::new("sandbox"));
        let state = p.run_multi_create("install nginx", &opts).await.unwrap();

        assert!(state.is_success);
        assert!(!state.execution_skipped);
        assert!(state.yaml.contains("apt-get install -y nginx"));
        assert_eq!(runner.runs().len(), 2);
        assert!(client.prompts()[2]
            .contains("Execution error:\nE: Unable to locate package ngnix"));

        let draft = p.drafts().snapshot("d2");
        assert_eq!(draft.metric(METRIC_VALIDATION_RETRIES), 1);
        assert_eq!(draft.metric(METRIC_REVIEW_RETRIES), 1);
        let review = &draft.reviews["step-1-install-nginx"];
        assert_eq!(review.attempts, 1);
        assert!(review.passed());
        assert_eq!(
            draft.steps["step-1-install-nginx"].source,
            Some(PatchSource::Reviewer)
        );
    }

    #[tokio::test]
    async fn test_reviewer_retries_exhausted() {
        let failing = ExecutionResult::failure("still broken", 1);
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(ONE_STEP_PLAN)
                .with_fallback(INSTALL_PATCH),
        );
        let runner = Arc::new(MockRunner::new().with_fallback(failing));
        let p = pipeline(client).with_runner(runner.clone());
        let opts = RunOptions::new()
            .with_draft_id("d3")
            .with_env(ValidationEnv::new("sandbox"));
        let state = p.run_multi_create("install nginx", &opts).await.unwrap();

        let draft = p.drafts().snapshot("d3");
        assert_eq!(draft.metric(METRIC_VALIDATION_RETRIES), 3);
        assert_eq!(draft.plan[0].status, StepStatus::Failed);
        assert!(!draft.reviews["step-1-install-nginx"].passed());
        assert_eq!(runner.runs().len(), 4);
        // the document itself is still well-formed
        assert!(state.issues.is_empty());
    }

    /// Records how many global slots were free while it ran
    struct LaneWatchRunner {
        lane: Arc<GlobalLane>,
        free: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl ValidationRunner for LaneWatchRunner {
        async fn run(&self, _env: &ValidationEnv, _yaml: &str) -> Result<ExecutionResult> {
            self.free.lock().unwrap().push(self.lane.available());
            Ok(ExecutionResult::success(""))
        }
    }

    #[tokio::test]
    async fn test_step_validation_holds_global_slot() {
        let lane = Arc::new(GlobalLane::new(2));
        let runner = Arc::new(LaneWatchRunner {
            lane: lane.clone(),
            free: std::sync::Mutex::new(Vec::new()),
        });
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(ONE_STEP_PLAN)
                .with_reply(INSTALL_PATCH),
        );
        let p = pipeline(client)
            .with_runner(runner.clone())
            .with_global_lane(lane.clone());
        let opts = RunOptions::new().with_env(ValidationEnv::new("sandbox"));
        p.run_multi_create("install nginx", &opts).await.unwrap();

        assert_eq!(*runner.free.lock().unwrap(), vec![1]);
        assert_eq!(lane.available(), 2);
    }

    struct StuckRunner;

    #[async_trait::async_trait]
    impl ValidationRunner for StuckRunner {
        async fn run(&self, _env: &ValidationEnv, _yaml: &str) -> Result<ExecutionResult> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(ExecutionResult::success(""))
        }
    }

    #[tokio::test]
    async fn test_cancel_during_step_validation() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(ONE_STEP_PLAN)
                .with_reply(INSTALL_PATCH),
        );
        let token = tokio_util::sync::CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let p = pipeline(client).with_runner(Arc::new(StuckRunner));
        let opts = RunOptions::new()
            .with_env(ValidationEnv::new("sandbox"))
            .with_cancel(token);
        let started = Instant::now();
        let err = p.run_multi_create("install nginx", &opts).await.unwrap_err();
        assert!(err.is_cancelled(), "{}", err);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(p.global_lane().available(), p.global_lane().limit());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(TWO_STEP_PLAN)
                .with_reply(INSTALL_PATCH)
                .with_reply(START_PATCH),
        );
        let p = pipeline(client.clone());
        let opts = RunOptions::new()
            .with_draft_id("d4")
            .with_checkpoint_id("cp-1")
            .with_pause_after_step("install nginx");
        let paused = p.run_multi_create("install and start nginx", &opts).await.unwrap();
        assert!(paused.paused);
        assert_eq!(paused.plan.len(), 2);
        assert!(p.checkpoints().get("cp-1").is_some());
        assert!(!paused.yaml.contains("systemctl"));

        let resumed = p
            .run_multi_create("", &RunOptions::new().with_resume_checkpoint_id("cp-1"))
            .await
            .unwrap();
        assert!(!resumed.paused);
        assert_eq!(resumed.draft_id, "d4");
        assert_eq!(resumed.prompt, "install and start nginx");
        assert!(resumed.yaml.contains("apt-get install -y nginx"));
        assert!(resumed.yaml.contains("systemctl start nginx"));
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_checkpoint() {
        let p = pipeline(Arc::new(MockChatClient::new()));
        let err = p
            .run_multi_create("", &RunOptions::new().with_resume_checkpoint_id("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "checkpoint nope not found");
    }

    #[tokio::test]
    async fn test_finalize_failure_keeps_state() {
        let reboot_patch =
            r#"{"step_name":"restart host","action":"cmd.run","with":{"cmd":"reboot"}}"#;
        let reboot_doc = r#"{"version":"v0.1","name":"restart","steps":[{"name":"restart host","action":"cmd.run","with":{"cmd":"reboot"}}]}"#;
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(r#"{"plan":[{"step_name":"restart host"}],"missing":[]}"#)
                .with_reply(reboot_patch)
                .with_fallback(reboot_doc),
        );
        let (sink, events) = collecting_sink();
        let err = pipeline(client)
            .run_multi_create("restart the host", &RunOptions::new().with_event_sink(sink))
            .await
            .unwrap_err();

        assert!(matches!(err.error, FlowError::ValidationFailed(_)));
        assert!(err
            .state
            .issues
            .contains(&"destructive command detected: shutdown or reboot".to_string()));
        assert_eq!(err.state.risk_level, RiskLevel::High);
        assert!(err.state.yaml.contains("reboot"));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.node == "finalize_failed"));
    }

    #[tokio::test]
    async fn test_same_session_runs_one_at_a_time() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(ONE_STEP_PLAN)
                .with_reply(INSTALL_PATCH)
                .with_reply(ONE_STEP_PLAN)
                .with_reply(INSTALL_PATCH),
        );
        let (sink, events) = collecting_sink();
        let p = Arc::new(pipeline(client));

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|draft| {
                let p = p.clone();
                let opts = RunOptions::new()
                    .with_session_key("shared")
                    .with_draft_id(draft)
                    .with_event_sink(sink.clone());
                tokio::spawn(async move { p.run_multi_create("install nginx", &opts).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_success);
        }

        let names: Vec<String> = events.lock().unwrap().iter().map(|e| e.node.clone()).collect();
        let first_done = names.iter().position(|n| n == "finalize_success").unwrap();
        let second_plan = names.iter().rposition(|n| n == "plan_ready").unwrap();
        assert!(second_plan > first_done);
    }

    #[tokio::test]
    async fn test_empty_prompt() {
        let p = pipeline(Arc::new(MockChatClient::new()));
        let err = p.run_multi_create("  ", &RunOptions::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "prompt is required");
    }
}
