//! Autonomous tool-calling loop
//!
//! Each iteration sends one fresh prompt and acts on exactly one decision:
//! call a tool, finish with a document, or stop and ask the user. Budgets,
//! timeouts and consecutive-failure limits bound the run, and metrics are
//! recorded on every exit.
//!
//! The `ralph` profile adds per-session loop memory, completion checks that
//! can reject a `final`, and no-progress detection over a content
//! fingerprint.

use flowsmith_agent::{parse_loop_action, ChatReply, LoopAction, ToolExecutor};
use flowsmith_core::{
    count_steps, fail_open::fail_open, merge_questions, tail_strings, truncate_chars, Event,
    EventStatus, FlowError, Mode, Result,
};
use flowsmith_memory::{
    append_progress_line, normalize_session_id, FileStore, InMemoryStore, LoopMemorySnapshot,
    LoopMemoryStore,
};
use flowsmith_metrics::{CompletionCheckResult, LoopMetrics, TerminationReason};
use flowsmith_validation::{merge_steps_into_base, steps_only_yaml};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::completion::{evaluate_completion, CompletionInput};
use crate::lanes::until_cancelled;
use crate::pipeline::Pipeline;
use crate::prompt::{build_loop_prompt, LoopPromptInput};
use crate::state::{AgentIdentity, Emitter, LoopProfile, RunError, RunOptions, RunResult, SynthesisState};
use crate::tools::BuiltinTools;

const MEMORY_EVENT: &str = "loop_memory";
const MEMORY_WARNING: &str = "loop_memory_warning";

/// Map a loop error to the termination reason recorded in metrics
pub fn termination_for(error: &FlowError) -> TerminationReason {
    match error {
        FlowError::Cancelled => TerminationReason::ContextCanceled,
        FlowError::BudgetExceeded(_) => TerminationReason::BudgetExceeded,
        FlowError::NoProgress => TerminationReason::NoProgress,
        FlowError::MaxIterations(_) => TerminationReason::MaxIters,
        _ => TerminationReason::Error,
    }
}

/// SHA-256 over what a stuck loop would keep repeating
pub fn progress_fingerprint(
    action: &LoopAction,
    yaml: &str,
    last_history: &str,
    checks: &[CompletionCheckResult],
) -> String {
    let payload = json!({
        "action": action.kind(),
        "tool": action.tool(),
        "yaml": steps_only_yaml(yaml),
        "last_history": last_history,
        "checks": checks,
    });
    hex::encode(Sha256::digest(payload.to_string().as_bytes()))
}

/// Whether the iteration loop keeps going
enum Step {
    Continue,
    Finished,
}

struct LoopRun<'a> {
    pipeline: &'a Pipeline,
    opts: &'a RunOptions,
    emitter: Emitter,
    tools: Arc<dyn ToolExecutor>,
    state: SynthesisState,
    loop_id: String,
    session_id: String,
    ralph: bool,
    max_iterations: usize,
    no_progress_limit: usize,
    timeout: Option<Duration>,
    memory: Option<Arc<dyn LoopMemoryStore>>,
    snapshot: LoopMemorySnapshot,
    history: Vec<String>,
    metrics: LoopMetrics,
    consecutive_failures: usize,
}

impl<'a> LoopRun<'a> {
    fn new(pipeline: &'a Pipeline, opts: &'a RunOptions, state: SynthesisState) -> Self {
        let defaults = &pipeline.config().loop_defaults;
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let loop_id = format!("loop-{}", nanos);
        let session_id = [
            opts.resume_checkpoint_id.as_str(),
            opts.session_key.as_str(),
            opts.draft_id.as_str(),
            loop_id.as_str(),
        ]
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(normalize_session_id)
        .unwrap_or_else(|| normalize_session_id(&loop_id));

        let ralph = opts.profile == LoopProfile::Ralph;
        let tools: Arc<dyn ToolExecutor> = match &opts.tools {
            Some(tools) => tools.clone(),
            None => Arc::new(BuiltinTools::new(pipeline.normalizer().clone())),
        };

        Self {
            pipeline,
            opts,
            emitter: Emitter::new(opts.event_sink.clone())
                .with_agent(AgentIdentity::new("Loop agent", "loop")),
            tools,
            state,
            metrics: LoopMetrics {
                loop_id: loop_id.clone(),
                session_id: session_id.clone(),
                mode_profile: opts.profile.as_str().to_string(),
                ..Default::default()
            },
            loop_id,
            session_id: session_id.clone(),
            ralph,
            max_iterations: opts
                .max_iterations
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_iterations),
            no_progress_limit: opts.no_progress_limit.unwrap_or(defaults.no_progress_limit),
            timeout: opts.per_iteration_timeout,
            memory: None,
            snapshot: LoopMemorySnapshot::new(session_id),
            history: Vec::new(),
            consecutive_failures: 0,
        }
    }

    fn memory_warning(&self, message: &str) {
        warn!("{}: {}", self.session_id, message);
        self.emitter.emit(
            Event::new(MEMORY_EVENT, EventStatus::Warning)
                .with_event_type(MEMORY_WARNING)
                .with_loop(&self.loop_id, self.metrics.iterations)
                .with_message(message),
        );
    }

    /// Pick the store, load the session and fold it into the run
    async fn open_memory(&mut self) {
        let root = self.opts.memory_root.clone().or_else(|| {
            self.pipeline
                .config()
                .memory
                .root
                .as_ref()
                .filter(|r| !r.trim().is_empty())
                .map(Into::into)
        });
        let mut store: Arc<dyn LoopMemoryStore> = match (&self.opts.memory_store, root) {
            (Some(store), _) => store.clone(),
            (None, Some(root)) => Arc::new(FileStore::new(root)),
            (None, None) => Arc::new(InMemoryStore::new()),
        };

        match store.load(&self.session_id).await {
            Ok((snapshot, found)) => {
                debug!("loop memory {} found={}", self.session_id, found);
                self.snapshot = LoopMemorySnapshot {
                    session_id: self.session_id.clone(),
                    ..snapshot
                };
                if !store.is_durable() {
                    self.metrics.non_durable = true;
                    self.memory_warning(
                        "durable memory backend not configured, fallback to in-memory store",
                    );
                }
            }
            Err(e) => {
                warn!("loop memory load failed: {}", e);
                store = Arc::new(InMemoryStore::new());
                self.metrics.non_durable = true;
                self.memory_warning(
                    "durable memory backend unavailable, switched to in-memory store",
                );
            }
        }
        self.memory = Some(store);

        let mut history = self.snapshot.checkpoint.tool_history.clone();
        history.append(&mut self.history);
        self.history = history;

        if self.state.base_yaml.is_empty() && !self.snapshot.checkpoint.last_yaml.trim().is_empty()
        {
            self.state.base_yaml = self.snapshot.checkpoint.last_yaml.trim().to_string();
        }
    }

    /// Persist the snapshot; a failed durable save degrades to in-process memory
    async fn save_memory(&mut self) {
        let Some(store) = self.memory.clone() else {
            return;
        };
        let saved = fail_open("loop_memory_save", || {
            store.save(&self.session_id, &self.snapshot)
        })
        .await;
        if saved.is_some() || !store.is_durable() {
            return;
        }

        self.memory_warning("durable memory save failed, switched to in-memory store");
        let fallback: Arc<dyn LoopMemoryStore> = Arc::new(InMemoryStore::new());
        if let Err(e) = fallback.save(&self.session_id, &self.snapshot).await {
            warn!("in-memory save failed: {}", e);
        }
        self.memory = Some(fallback);
        self.metrics.non_durable = true;
    }

    fn progress(&mut self, line: &str) {
        let stamped = format!("[{}] {}", chrono::Utc::now().to_rfc3339(), line);
        append_progress_line(&mut self.snapshot.progress, &stamped);
    }

    fn update_checkpoint(&mut self, iteration: usize) {
        let limit = self.pipeline.config().loop_defaults.history_limit;
        let checkpoint = &mut self.snapshot.checkpoint;
        checkpoint.iteration = iteration;
        checkpoint.tool_calls = self.metrics.tool_calls;
        checkpoint.tool_failures = self.metrics.tool_failures;
        checkpoint.tool_history = tail_strings(&self.history, limit);
        if !self.state.yaml.trim().is_empty() {
            checkpoint.last_yaml = self.state.yaml.clone();
        }
    }

    /// Count a retryable failure; the error surfaces once the threshold is hit
    fn record_failure(&mut self, error: FlowError) -> Result<()> {
        self.consecutive_failures += 1;
        let threshold = self.pipeline.config().loop_defaults.failure_threshold.max(1);
        if self.consecutive_failures >= threshold {
            return Err(error);
        }
        warn!(
            "loop failure {}/{}: {}",
            self.consecutive_failures, threshold, error
        );
        Ok(())
    }

    /// Race `fut` against the caller's token and the per-iteration timeout
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let fut = until_cancelled(&self.opts.cancel, fut);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| FlowError::Timeout("loop iteration".to_string()))?,
            None => fut.await,
        }
    }

    fn check_budget(&self, iteration: usize) -> Result<()> {
        let max_tool_calls = self.opts.max_tool_calls;
        if max_tool_calls > 0 && self.metrics.tool_calls >= max_tool_calls {
            return Err(FlowError::BudgetExceeded("max tool calls reached".to_string()));
        }
        let units = self.opts.max_budget_units;
        if units > 0 && iteration + self.metrics.tool_calls > units {
            return Err(FlowError::BudgetExceeded(format!(
                "budget units exhausted ({})",
                units
            )));
        }
        Ok(())
    }

    fn build_prompt(&self, iteration: usize) -> String {
        let tool_names = self.tools.tool_names();
        let history = tail_strings(
            &self.history,
            self.pipeline.config().loop_defaults.history_limit,
        );
        build_loop_prompt(&LoopPromptInput {
            prompt: &self.state.prompt,
            context: &self.state.context,
            base_yaml: &self.state.base_yaml,
            tool_names: &tool_names,
            history: &history,
            iteration,
            max_iterations: self.max_iterations,
            ralph: self.ralph,
            completion_token: &self.opts.completion_token,
            completion_checks: &self.opts.completion_checks,
            stop_reasons: &self.snapshot.checkpoint.last_stop_reasons,
            progress: &self.snapshot.progress,
        })
    }

    async fn drive(&mut self) -> Result<()> {
        for iteration in 1..=self.max_iterations {
            if self.opts.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            self.check_budget(iteration)?;
            self.metrics.iterations = iteration;

            let prompt = self.build_prompt(iteration);
            if prompt.chars().count() > self.pipeline.config().loop_defaults.max_prompt_chars {
                return Err(FlowError::Loop("loop prompt too long".to_string()));
            }
            debug!("loop {} iteration {}", self.loop_id, iteration);

            let chat = self
                .pipeline
                .chat(self.opts, &self.state.system_prompt, prompt);
            let reply = match self.bounded(chat).await {
                Ok(reply) => reply,
                Err(FlowError::Timeout(_)) => {
                    return Err(FlowError::BudgetExceeded("loop iteration timeout".to_string()))
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.record_failure(e)?;
                    continue;
                }
            };
            if !reply.thought.trim().is_empty() {
                self.state.thought = reply.thought.trim().to_string();
            }

            let action = match parse_loop_action(&reply.content) {
                Ok(action) => action,
                Err(e) => {
                    self.record_failure(e)?;
                    continue;
                }
            };

            let step = match &action {
                LoopAction::ToolCall { tool, args } => {
                    self.tool_call(iteration, &action, tool, args).await?
                }
                LoopAction::Final { .. } => self.final_answer(iteration, &action, &reply).await?,
                LoopAction::NeedMoreInfo { questions, message } => {
                    self.state.questions = merge_questions(&self.state.questions, questions);
                    if !message.trim().is_empty() {
                        self.state.summary = message.trim().to_string();
                    }
                    Step::Finished
                }
            };
            if let Step::Finished = step {
                return Ok(());
            }
        }
        Err(FlowError::MaxIterations(self.max_iterations))
    }

    /// Steps of a `final` action: inline, then `result`, then the raw reply
    fn final_document(action: &LoopAction, reply: &str) -> Result<String> {
        let LoopAction::Final { yaml, result, .. } = action else {
            return Ok(String::new());
        };
        if !yaml.trim().is_empty() {
            let steps = steps_only_yaml(yaml);
            if steps.is_empty() {
                return Err(FlowError::Loop("loop final output missing steps".to_string()));
            }
            return Ok(steps);
        }
        for source in [result.as_str(), reply] {
            if source.trim().is_empty() {
                continue;
            }
            if let Ok(extracted) = flowsmith_agent::extract_workflow_yaml(source) {
                let steps = steps_only_yaml(&extracted.yaml);
                if !steps.is_empty() {
                    return Ok(steps);
                }
            }
        }
        Err(FlowError::Loop("loop final output missing yaml".to_string()))
    }

    async fn final_answer(
        &mut self,
        iteration: usize,
        action: &LoopAction,
        reply: &ChatReply,
    ) -> Result<Step> {
        let steps = Self::final_document(action, &reply.content)?;
        self.state.yaml = merge_steps_into_base(&self.state.base_yaml, &steps);
        if let LoopAction::Final {
            questions, message, ..
        } = action
        {
            self.state.questions = merge_questions(&self.state.questions, questions);
            if !message.trim().is_empty() {
                self.state.summary = message.trim().to_string();
            }
        }

        if !self.ralph {
            return Ok(Step::Finished);
        }

        let risk = self
            .pipeline
            .normalizer()
            .risk_evaluator()
            .evaluate(&self.state.yaml)
            .level;
        let evaluation = evaluate_completion(
            &self.opts.completion_checks,
            &self.opts.completion_token,
            &CompletionInput {
                action,
                reply: &reply.content,
                yaml: &self.state.yaml,
                risk,
                snapshot: &self.snapshot,
            },
        );
        self.metrics.checks = evaluation.checks.clone();

        if evaluation.passed {
            self.snapshot.checkpoint.last_stop_reasons.clear();
            self.update_checkpoint(iteration);
            self.progress(&format!("iteration={} final accepted", iteration));
            self.save_memory().await;
            return Ok(Step::Finished);
        }

        info!("final blocked: {}", evaluation.failed.join("; "));
        self.snapshot.checkpoint.last_stop_reasons = evaluation.failed.clone();
        self.progress(&format!(
            "iteration={} final blocked: {}",
            iteration,
            evaluation.failed.join("; ")
        ));
        self.emitter.emit(
            Event::new("stop_hook", EventStatus::Blocked)
                .with_event_type("completion_blocked")
                .with_loop(&self.loop_id, iteration)
                .with_message(evaluation.failed.join("; "))
                .with_data(json!({ "failed_checks": evaluation.failed })),
        );

        let last = self.history.last().cloned().unwrap_or_default();
        let fingerprint = progress_fingerprint(action, &self.state.yaml, &last, &evaluation.checks);
        if self
            .snapshot
            .checkpoint
            .observe_fingerprint(&fingerprint, self.no_progress_limit)
        {
            self.update_checkpoint(iteration);
            self.save_memory().await;
            return Err(FlowError::NoProgress);
        }

        self.update_checkpoint(iteration);
        self.save_memory().await;
        self.consecutive_failures = 0;
        self.history
            .push(format!("stop_hook_blocked={}", evaluation.failed.join("; ")));
        Ok(Step::Continue)
    }

    async fn tool_call(
        &mut self,
        iteration: usize,
        action: &LoopAction,
        tool: &str,
        args: &Value,
    ) -> Result<Step> {
        if tool.trim().is_empty() {
            return Err(FlowError::Loop("tool_call missing tool name".to_string()));
        }
        self.check_budget(iteration)?;
        self.metrics.tool_calls += 1;

        let call_id = format!("{}-{}-{}", self.loop_id, iteration, tool);
        self.emitter.emit(
            Event::new(tool, EventStatus::Start)
                .with_call_id(&call_id)
                .with_loop(&self.loop_id, iteration)
                .with_agent_status("tool_call")
                .with_event_type("tool_call")
                .with_data(json!({ "args": args })),
        );

        let output = match self.bounded(self.tools.execute(tool, args)).await {
            Err(FlowError::Timeout(_)) => {
                return Err(FlowError::BudgetExceeded("loop iteration timeout".to_string()))
            }
            Err(e) if e.is_cancelled() => return Err(e),
            other => other,
        };
        let limit = self.pipeline.config().loop_defaults.tool_output_limit;

        match output {
            Err(e) => {
                self.metrics.tool_failures += 1;
                self.emitter.emit(
                    Event::new(tool, EventStatus::Error)
                        .with_call_id(&call_id)
                        .with_loop(&self.loop_id, iteration)
                        .with_agent_status("tool_result")
                        .with_event_type("tool_result")
                        .with_message(e.to_string())
                        .with_data(json!({ "tool_output_content": e.to_string() })),
                );
                let entry = format!("tool={} error={}", tool, truncate_chars(&e.to_string(), limit));
                self.history.push(entry.clone());
                if self.ralph {
                    self.progress(&format!("iteration={} {}", iteration, entry));
                    self.update_checkpoint(iteration);
                    self.save_memory().await;
                }
                self.record_failure(e)?;
            }
            Ok(output) => {
                self.consecutive_failures = 0;
                self.emitter.emit(
                    Event::new(tool, EventStatus::Done)
                        .with_call_id(&call_id)
                        .with_loop(&self.loop_id, iteration)
                        .with_agent_status("tool_result")
                        .with_event_type("tool_result")
                        .with_data(json!({ "tool_output_content": output })),
                );
                let entry = format!("tool={} output={}", tool, truncate_chars(&output, limit));
                self.history.push(entry.clone());
                if self.ralph {
                    self.progress(&format!("iteration={} {}", iteration, entry));
                    let yaml = args
                        .get("yaml")
                        .and_then(Value::as_str)
                        .unwrap_or(&self.state.yaml)
                        .to_string();
                    let fingerprint = progress_fingerprint(action, &yaml, &entry, &[]);
                    let stalled = self
                        .snapshot
                        .checkpoint
                        .observe_fingerprint(&fingerprint, self.no_progress_limit);
                    self.update_checkpoint(iteration);
                    self.save_memory().await;
                    if stalled {
                        return Err(FlowError::NoProgress);
                    }
                }
            }
        }
        Ok(Step::Continue)
    }

    /// Normalize whatever document the loop produced and settle the verdict
    fn settle(&mut self) {
        let state = &mut self.state;
        if state.yaml.trim().is_empty() {
            state.is_success = false;
        } else {
            let outcome = self.pipeline.normalizer().normalize(&state.yaml);
            state.yaml = outcome.yaml;
            state.issues = outcome.issues;
            state.notices = merge_questions(&state.notices, &outcome.notices);
            state.risk_level = outcome.risk.level;
            state.risk_notes = outcome.risk.notes;
            state.is_success = state.issues.is_empty();
        }
        state.execution_skipped = true;
        state.needs_review = state.review_required();
        if state.summary.is_empty() {
            state.summary = format!(
                "steps={} risk={} issues={}",
                count_steps(&state.yaml),
                state.risk_level,
                state.issues.len()
            );
        }
    }
}

impl Pipeline {
    /// Run the autonomous tool-calling loop
    #[instrument(skip(self, prompt, opts), fields(profile = %opts.profile))]
    pub async fn run_loop(&self, prompt: &str, opts: &RunOptions) -> RunResult {
        let state = self.new_state(Mode::Generate, prompt, opts);
        if let Err(e) = self.client() {
            return Err(RunError::new(e, state));
        }
        if state.prompt.is_empty() {
            return Err(RunError::new(
                FlowError::InvalidInput("prompt is required".to_string()),
                state,
            ));
        }

        let started = Instant::now();
        let mut run = LoopRun::new(self, opts, state);
        info!("loop {} session {}", run.loop_id, run.session_id);
        if run.ralph {
            run.open_memory().await;
        }

        let outcome = run.drive().await;
        run.metrics.duration_ms = started.elapsed().as_millis() as u64;
        run.metrics.terminal = match &outcome {
            Ok(()) => TerminationReason::Completed,
            Err(e) => termination_for(e),
        };
        self.metrics_collector().record(&run.metrics).await;
        info!(
            "loop {} finished: {} after {} iterations",
            run.loop_id, run.metrics.terminal, run.metrics.iterations
        );

        let metrics = run.metrics.clone();
        let status = if outcome.is_ok() {
            EventStatus::Done
        } else {
            EventStatus::Error
        };
        run.emitter.emit(
            Event::new("loop", status)
                .with_event_type("loop_done")
                .with_loop(&run.loop_id, metrics.iterations)
                .with_message(metrics.terminal.as_str())
                .with_data(json!({ "metrics": metrics })),
        );

        match outcome {
            Ok(()) => {
                run.settle();
                let mut state = run.state;
                state.loop_metrics = Some(metrics);
                Ok(state)
            }
            Err(e) if opts.fallback_to_pipeline && !e.is_cancelled() => {
                warn!("loop failed ({}), falling back to the pipeline", e);
                match self.run_generate(prompt, opts).await {
                    Ok(mut state) => {
                        state.loop_metrics = Some(metrics);
                        Ok(state)
                    }
                    Err(mut err) => {
                        err.state.loop_metrics = Some(metrics);
                        Err(err)
                    }
                }
            }
            Err(e) => {
                let mut state = run.state;
                state.last_error = e.to_string();
                state.needs_review = true;
                state.loop_metrics = Some(metrics);
                Err(RunError::new(e, state))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::collecting_sink;
    use flowsmith_agent::{MockChatClient, MockToolExecutor};
    use flowsmith_core::FlowConfig;
    use tempfile::TempDir;

    const NGINX_YAML: &str = "version: v0.1\nname: install-nginx\nsteps:\n- name: install nginx\n  action: cmd.run\n  with:\n    cmd: apt-get install -y nginx\n";

    fn final_reply(message: &str) -> String {
        json!({ "action": "final", "yaml": NGINX_YAML, "message": message }).to_string()
    }

    fn tool_reply(tool: &str) -> String {
        json!({ "action": "tool_call", "tool": tool, "args": { "yaml": NGINX_YAML } }).to_string()
    }

    fn pipeline(client: Arc<MockChatClient>) -> Pipeline {
        Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client)
    }

    #[tokio::test]
    async fn test_tool_call_then_final() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(tool_reply("validate_workflow"))
                .with_reply(final_reply("")),
        );
        let (sink, events) = collecting_sink();
        let p = pipeline(client.clone());
        let state = p
            .run_loop("install nginx", &RunOptions::new().with_event_sink(sink))
            .await
            .unwrap();

        let metrics = state.loop_metrics.clone().unwrap();
        assert_eq!(metrics.terminal, TerminationReason::Completed);
        assert_eq!(metrics.iterations, 2);
        assert_eq!(metrics.tool_calls, 1);
        assert_eq!(metrics.tool_failures, 0);
        assert!(state.issues.is_empty(), "{:?}", state.issues);
        assert!(state.is_success);
        assert!(!state.needs_review);
        assert!(state.yaml.contains("apt-get install -y nginx"));

        let second = &client.prompts()[1];
        assert!(second.contains("- tool=validate_workflow output={\"issues\":[]"));

        let events = events.lock().unwrap();
        let tool_events: Vec<_> = events
            .iter()
            .filter(|e| e.node == "validate_workflow")
            .collect();
        assert_eq!(tool_events.len(), 2);
        assert_eq!(tool_events[0].event_type, "tool_call");
        assert_eq!(tool_events[1].event_type, "tool_result");
        assert!(tool_events[1].call_id.ends_with("-1-validate_workflow"));
        assert_eq!(tool_events[1].agent_role, "loop");
        assert_eq!(p.metrics_collector().global_summary().total_loops, 1);
    }

    #[tokio::test]
    async fn test_max_iterations() {
        let client = Arc::new(MockChatClient::new().with_fallback(tool_reply("lint")));
        let tools = Arc::new(MockToolExecutor::new().with_output("lint", "ok"));
        let p = pipeline(client);
        let err = p
            .run_loop("install nginx", &RunOptions::new().with_tools(tools.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err.error, FlowError::MaxIterations(6)));
        let metrics = err.state.loop_metrics.clone().unwrap();
        assert_eq!(metrics.terminal, TerminationReason::MaxIters);
        assert_eq!(metrics.iterations, 6);
        assert_eq!(tools.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_need_more_info() {
        let reply = json!({ "action": "need_more_info", "questions": ["Which hosts?"], "message": "need hosts" });
        let p = pipeline(Arc::new(MockChatClient::new().with_reply(reply.to_string())));
        let state = p.run_loop("deploy", &RunOptions::new()).await.unwrap();
        assert_eq!(state.questions, vec!["Which hosts?".to_string()]);
        assert_eq!(state.summary, "need hosts");
        assert!(state.needs_review);
        assert!(state.loop_metrics.unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_consecutive_parse_failures() {
        let p = pipeline(Arc::new(MockChatClient::new().with_fallback("not json at all")));
        let err = p.run_loop("install nginx", &RunOptions::new()).await.unwrap_err();
        assert!(matches!(err.error, FlowError::Parse(_)));
        let metrics = err.state.loop_metrics.clone().unwrap();
        assert_eq!(metrics.terminal, TerminationReason::Error);
        assert_eq!(metrics.iterations, 2);
    }

    #[tokio::test]
    async fn test_tool_budget() {
        let client = Arc::new(MockChatClient::new().with_fallback(tool_reply("risk_scan")));
        let p = pipeline(client);
        let err = p
            .run_loop("install nginx", &RunOptions::new().with_max_tool_calls(2))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "loop budget exceeded: max tool calls reached");
        let metrics = err.state.loop_metrics.clone().unwrap();
        assert_eq!(metrics.terminal, TerminationReason::BudgetExceeded);
        assert_eq!(metrics.tool_calls, 2);
    }

    #[tokio::test]
    async fn test_ralph_blocked_then_accepted() {
        let token = "<promise>DONE</promise>";
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(final_reply("done"))
                .with_reply(final_reply(&format!("done {}", token))),
        );
        let store = Arc::new(InMemoryStore::new());
        let (sink, events) = collecting_sink();
        let opts = RunOptions::new()
            .with_profile(LoopProfile::Ralph)
            .with_session_key("Session 1")
            .with_completion_token(token)
            .with_completion_checks(vec!["has_steps".to_string()])
            .with_memory_store(store.clone())
            .with_event_sink(sink);

        let p = pipeline(client.clone());
        let state = p.run_loop("install nginx", &opts).await.unwrap();
        let metrics = state.loop_metrics.clone().unwrap();
        assert_eq!(metrics.terminal, TerminationReason::Completed);
        assert_eq!(metrics.iterations, 2);
        assert_eq!(metrics.session_id, "session-1");
        assert!(metrics.non_durable);
        assert!(metrics.checks.iter().all(|c| c.passed));

        assert!(client.prompts()[1]
            .contains("- completion_token: completion token not found"));

        let (snapshot, found) = store.load("session-1").await.unwrap();
        assert!(found);
        assert!(snapshot.progress.contains("final blocked: completion_token"));
        assert!(snapshot.progress.contains("iteration=2 final accepted"));
        assert!(snapshot.checkpoint.last_stop_reasons.is_empty());
        assert!(snapshot.checkpoint.last_yaml.contains("install nginx"));

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.node == "stop_hook" && e.status == EventStatus::Blocked));
        assert!(events
            .iter()
            .any(|e| e.event_type == MEMORY_WARNING && e.status == EventStatus::Warning));
    }

    #[tokio::test]
    async fn test_ralph_no_progress() {
        let client = Arc::new(MockChatClient::new().with_fallback(final_reply("done")));
        let opts = RunOptions::new()
            .with_profile(LoopProfile::Ralph)
            .with_completion_token("<promise>DONE</promise>");
        let err = pipeline(client).run_loop("install nginx", &opts).await.unwrap_err();
        assert!(matches!(err.error, FlowError::NoProgress));
        let metrics = err.state.loop_metrics.clone().unwrap();
        assert_eq!(metrics.terminal, TerminationReason::NoProgress);
        assert_eq!(metrics.iterations, 4);
    }

    #[tokio::test]
    async fn test_ralph_file_memory_resumes() {
        let dir = TempDir::new().unwrap();
        let opts = RunOptions::new()
            .with_profile(LoopProfile::Ralph)
            .with_session_key("nginx")
            .with_memory_root(dir.path());

        let first = Arc::new(MockChatClient::new().with_reply(final_reply("done")));
        let state = pipeline(first).run_loop("install nginx", &opts).await.unwrap();
        assert!(!state.loop_metrics.unwrap().non_durable);
        assert!(dir.path().join("nginx").join("checkpoint.json").exists());

        let second = Arc::new(MockChatClient::new().with_reply(final_reply("again")));
        pipeline(second.clone())
            .run_loop("install nginx", &opts)
            .await
            .unwrap();
        let prompt = &second.prompts()[0];
        assert!(prompt.contains("Current workflow YAML:"));
        assert!(prompt.contains("Progress so far:"));
    }

    /// Durable store whose writes always fail
    struct ReadOnlyStore;

    #[async_trait::async_trait]
    impl LoopMemoryStore for ReadOnlyStore {
        async fn load(&self, session_id: &str) -> Result<(LoopMemorySnapshot, bool)> {
            Ok((LoopMemorySnapshot::new(session_id), false))
        }

        async fn save(&self, _session_id: &str, _snapshot: &LoopMemorySnapshot) -> Result<()> {
            Err(FlowError::Other("read-only file system".to_string()))
        }

        fn is_durable(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "read-only"
        }
    }

    #[tokio::test]
    async fn test_ralph_save_failure_degrades_to_memory() {
        let (sink, events) = collecting_sink();
        let opts = RunOptions::new()
            .with_profile(LoopProfile::Ralph)
            .with_memory_store(Arc::new(ReadOnlyStore))
            .with_event_sink(sink);
        let client = Arc::new(MockChatClient::new().with_reply(final_reply("done")));
        let state = pipeline(client).run_loop("install nginx", &opts).await.unwrap();

        let metrics = state.loop_metrics.unwrap();
        assert!(metrics.is_completed());
        assert!(metrics.non_durable);
        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| e.event_type == MEMORY_WARNING
            && e.message == "durable memory save failed, switched to in-memory store"));
    }

    #[tokio::test]
    async fn test_fallback_to_pipeline() {
        let client = Arc::new(
            MockChatClient::new()
                .with_error("backend down")
                .with_error("backend down")
                .with_reply(crate::pipeline::tests::INTENT_JSON)
                .with_reply(crate::pipeline::tests::NGINX_JSON),
        );
        let opts = RunOptions::new().with_fallback_to_pipeline();
        let state = pipeline(client).run_loop("install nginx", &opts).await.unwrap();
        assert!(state.issues.is_empty());
        let metrics = state.loop_metrics.unwrap();
        assert_eq!(metrics.terminal, TerminationReason::Error);
        assert_eq!(metrics.iterations, 2);
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl ToolExecutor for SlowTool {
        async fn execute(&self, _tool: &str, _args: &Value) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["lint".to_string()]
        }
    }

    #[tokio::test]
    async fn test_cancel_during_tool_call() {
        let client = Arc::new(MockChatClient::new().with_fallback(tool_reply("lint")));
        let token = tokio_util::sync::CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let opts = RunOptions::new()
            .with_tools(Arc::new(SlowTool))
            .with_max_iterations(1)
            .with_cancel(token);
        let started = Instant::now();
        let err = pipeline(client).run_loop("install nginx", &opts).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.is_cancelled(), "{}", err);
        let metrics = err.state.loop_metrics.clone().unwrap();
        assert_eq!(metrics.terminal, TerminationReason::ContextCanceled);
        assert_eq!(metrics.tool_calls, 1);
    }

    #[tokio::test]
    async fn test_missing_client() {
        let p = Pipeline::new(FlowConfig::default()).unwrap();
        let err = p.run_loop("install nginx", &RunOptions::new()).await.unwrap_err();
        assert!(matches!(err.error, FlowError::ClientNotConfigured));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let action = LoopAction::ToolCall {
            tool: "risk_scan".to_string(),
            args: Value::Null,
        };
        let a = progress_fingerprint(&action, NGINX_YAML, "tool=risk_scan output=ok", &[]);
        let b = progress_fingerprint(&action, NGINX_YAML, "tool=risk_scan output=ok", &[]);
        let c = progress_fingerprint(&action, NGINX_YAML, "tool=risk_scan output=high", &[]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
