//! Coordinator loop with per-step sub-loops
//!
//! The coordinator plans once. Each plan step is then written as a YAML
//! fragment and reviewed by a second call, for at most
//! [`SUBLOOP_MAX_ROUNDS`] rounds, and the accepted fragment is merged into
//! the document by step name before the next step starts.

use flowsmith_agent::ChatReply;
use flowsmith_core::{
    count_steps, merge_questions, Event, EventStatus, FlowError, Mode, Result, StepStatus,
};
use flowsmith_planning::{
    assign_plan_ids, build_coordinator_prompt, build_fragment_review_prompt, build_subloop_prompt,
    fallback_plan, parse_coordinator_reply, parse_review_issues, parse_subloop_reply,
    validate_sub_plan, PlanStep, SUBLOOP_REVIEW_SYSTEM_PROMPT, SUBLOOP_SYSTEM_PROMPT,
};
use flowsmith_validation::merge_fragment_into_steps;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::pipeline::Pipeline;
use crate::state::{AgentIdentity, Emitter, RunError, RunOptions, RunResult, SynthesisState};

/// Write/review rounds per plan step
pub const SUBLOOP_MAX_ROUNDS: usize = 2;

/// What one step's sub-loop settled on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubLoopResult {
    pub yaml_fragment: String,
    /// Reviewer issues still open after the last round
    pub issues: Vec<String>,
    pub rounds: usize,
}

fn event(name: &str, status: EventStatus) -> Event {
    Event::new(name, status).with_event_type(name)
}

fn step_event(name: &str, step: &PlanStep, status: EventStatus) -> Event {
    event(name, status)
        .with_parent_step(&step.id)
        .with_display_name(&step.step_name)
}

fn round_event(step: &PlanStep, round: usize, status: EventStatus) -> Event {
    event("subloop_round", status)
        .with_display_name("subloop_round")
        .with_call_id(format!("subloop-{}-{}", step.id, round))
        .with_parent_step(&step.id)
}

impl Pipeline {
    /// One model call admitted through the global lane
    async fn admitted_chat(
        &self,
        opts: &RunOptions,
        system_prompt: &str,
        prompt: String,
    ) -> Result<ChatReply> {
        self.global_lane()
            .run(&opts.cancel, || self.chat(opts, system_prompt, prompt))
            .await
    }

    async fn write_fragment(
        &self,
        step: &PlanStep,
        issues: &[String],
        opts: &RunOptions,
    ) -> Result<String> {
        let prompt = build_subloop_prompt(step, issues);
        let reply = self
            .admitted_chat(opts, SUBLOOP_SYSTEM_PROMPT, prompt)
            .await?;
        let fragment = parse_subloop_reply(&reply.content)?;
        validate_sub_plan(&fragment, step)?;
        Ok(fragment)
    }

    async fn review_fragment(
        &self,
        fragment: &str,
        known_issues: &[String],
        opts: &RunOptions,
    ) -> Result<Vec<String>> {
        let prompt = build_fragment_review_prompt(fragment, known_issues);
        let reply = self
            .admitted_chat(opts, SUBLOOP_REVIEW_SYSTEM_PROMPT, prompt)
            .await?;
        parse_review_issues(&reply.content)
    }

    /// Write and review one plan step until the reviewer is satisfied
    ///
    /// A failed round feeds its error into the next one. The last accepted
    /// fragment is returned with whatever issues are still open; having none
    /// at all is an error.
    pub(crate) async fn run_subloop(
        &self,
        step: &PlanStep,
        opts: &RunOptions,
        emitter: &Emitter,
    ) -> Result<SubLoopResult> {
        self.client()?;
        let mut issues: Vec<String> = Vec::new();
        let mut fragment = String::new();

        for round in 1..=SUBLOOP_MAX_ROUNDS {
            let ids = json!({ "round": round, "step_id": step.id, "step_name": step.step_name });
            emitter.emit(
                round_event(step, round, EventStatus::Start)
                    .with_message("subloop round start")
                    .with_data(ids),
            );

            match self.write_fragment(step, &issues, opts).await {
                Ok(next) => fragment = next,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!("subloop round {} for {} failed: {}", round, step.id, e);
                    issues.push(e.to_string());
                    continue;
                }
            }
            match self.review_fragment(&fragment, &issues, opts).await {
                Ok(found) => issues = found,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!("subloop review {} for {} failed: {}", round, step.id, e);
                    issues.push(e.to_string());
                    continue;
                }
            }

            emitter.emit(
                round_event(step, round, EventStatus::Done)
                    .with_message(format!("issues={}", issues.len()))
                    .with_data(json!({
                        "round": round,
                        "step_id": step.id,
                        "step_name": step.step_name,
                        "issues": issues,
                    })),
            );
            if issues.is_empty() {
                return Ok(SubLoopResult {
                    yaml_fragment: fragment,
                    issues,
                    rounds: round,
                });
            }
        }

        if fragment.is_empty() {
            return Err(FlowError::Loop(format!(
                "subloop failed for step {}: {}",
                step.step_name,
                issues.join("; ")
            )));
        }
        Ok(SubLoopResult {
            yaml_fragment: fragment,
            issues,
            rounds: SUBLOOP_MAX_ROUNDS,
        })
    }

    /// Plan the request, then build the document one reviewed step at a time
    #[instrument(skip(self, prompt, opts), fields(prompt_len = prompt.len()))]
    pub async fn run_coordinator_loop(&self, prompt: &str, opts: &RunOptions) -> RunResult {
        let mut state = self.new_state(Mode::Generate, prompt, opts);
        if let Err(e) = self.client() {
            return Err(RunError::new(e, state));
        }
        if state.prompt.is_empty() {
            return Err(RunError::new(
                FlowError::InvalidInput("prompt is required".to_string()),
                state,
            ));
        }

        let emitter = Emitter::new(opts.event_sink.clone())
            .with_agent(AgentIdentity::new("Coordinator", "coordinator"));
        state.yaml = state.base_yaml.clone();
        match self.coordinate_steps(&mut state, opts, &emitter).await {
            Ok(()) => {
                info!("coordinator loop finished: {}", state.summary);
                Ok(state)
            }
            Err(e) => {
                warn!("coordinator loop failed: {}", e);
                state.last_error = e.to_string();
                state.needs_review = true;
                Err(RunError::new(e, state))
            }
        }
    }

    async fn coordinate_steps(
        &self,
        state: &mut SynthesisState,
        opts: &RunOptions,
        emitter: &Emitter,
    ) -> Result<()> {
        emitter.emit(event("coordinator", EventStatus::Start));
        let prompt = build_coordinator_prompt(&state.prompt, &state.context);
        let reply = self
            .admitted_chat(opts, &state.system_prompt, prompt)
            .await?;
        state.thought = reply.thought.trim().to_string();
        let outcome = parse_coordinator_reply(&reply.content)?;

        let mut plan = if outcome.plan.is_empty() {
            fallback_plan(&state.prompt)
        } else {
            outcome.plan
        };
        assign_plan_ids(&mut plan);
        for step in plan.iter_mut() {
            step.status = StepStatus::Pending;
        }
        state.plan = plan;
        emitter.emit(
            event("plan_ready", EventStatus::Done)
                .with_message(format!("{} steps", state.plan.len()))
                .with_data(json!({ "plan": state.plan })),
        );

        let mut open_issues: Vec<String> = Vec::new();
        for index in 0..state.plan.len() {
            if opts.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let step = state.plan[index].clone();
            state.plan[index].status = StepStatus::InProgress;
            emitter.emit(step_event("plan_step_start", &step, EventStatus::Start));

            let merged = match self.run_subloop(&step, opts, emitter).await {
                Ok(result) => self.merge_step(state, &step, result, emitter),
                Err(e) => Err(e),
            };
            match merged {
                Ok(issues) => open_issues = merge_questions(&open_issues, &issues),
                Err(e) => {
                    state.plan[index].status = StepStatus::Failed;
                    emitter.emit(
                        step_event("plan_step_done", &step, EventStatus::Error)
                            .with_message(e.to_string()),
                    );
                    return Err(e);
                }
            }

            state.plan[index].status = StepStatus::Done;
            emitter.emit(step_event("plan_step_done", &step, EventStatus::Done));
        }

        let outcome = self.normalizer().normalize(&state.yaml);
        state.yaml = outcome.yaml;
        state.issues = merge_questions(&outcome.issues, &open_issues);
        state.notices = merge_questions(&state.notices, &outcome.notices);
        state.risk_level = outcome.risk.level;
        state.risk_notes = outcome.risk.notes;
        state.execution_skipped = true;
        state.is_success = state.issues.is_empty();
        state.needs_review = state.review_required();
        state.summary = format!(
            "steps={} risk={} issues={}",
            count_steps(&state.yaml),
            state.risk_level,
            state.issues.len()
        );
        emitter.emit(
            event("coordinator_done", EventStatus::Done)
                .with_message(state.summary.clone())
                .with_data(json!({ "yaml": state.yaml })),
        );
        Ok(())
    }

    /// Fold a step's fragment into the document; returns its open issues
    fn merge_step(
        &self,
        state: &mut SynthesisState,
        step: &PlanStep,
        result: SubLoopResult,
        emitter: &Emitter,
    ) -> Result<Vec<String>> {
        if result.yaml_fragment.is_empty() {
            return Ok(result.issues);
        }
        let merged = merge_fragment_into_steps(&state.yaml, &result.yaml_fragment)?;
        let previous = std::mem::replace(&mut state.yaml, merged);
        if !previous.trim().is_empty() {
            state.history.push(previous);
        }
        emitter.emit(
            step_event("merge_patch", step, EventStatus::Done)
                .with_message("merge patch")
                .with_data(json!({
                    "yaml_fragment": result.yaml_fragment,
                    "yaml": state.yaml,
                    "rounds": result.rounds,
                })),
        );
        Ok(result.issues)
    }
}
