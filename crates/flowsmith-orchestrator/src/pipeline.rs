//! Single-pass synthesis pipeline
//!
//! [`Pipeline`] owns the backends and the shared stores. `run_generate` and
//! `run_fix` walk the compiled [`Graph`] over a fresh [`SynthesisState`];
//! each node emits start and outcome events and the returned state is the
//! authoritative result.
//!
//! In generate mode an intent extraction call runs before generation. When
//! it reports missing inputs, or the prompt is only a greeting, the run
//! answers with clarifying questions and never reaches the generator.

use flowsmith_agent::{
    extract_workflow_yaml, ChatClient, ChatMessage, ChatReply, ValidationRunner,
};
use flowsmith_core::{
    count_steps, merge_questions, normalize_questions, Event, EventStatus, FlowConfig, FlowError,
    Mode, Result, RiskLevel, Workflow,
};
use flowsmith_metrics::MetricsCollector;
use flowsmith_planning::{
    build_intent_prompt, is_greeting_prompt, parse_intent_reply, questions_from_missing, Intent,
    INTENT_SYSTEM_PROMPT,
};
use flowsmith_validation::{force_manual_approve, merge_steps_into_base, Normalizer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::draft_store::DraftStore;
use crate::graph::{Graph, NodeId};
use crate::lanes::{until_cancelled, GlobalLane, SessionLane};
use crate::prompt::{build_fix_prompt, build_generate_prompt};
use crate::state::{Emitter, RunError, RunOptions, RunResult, SynthesisState};

fn node_event(node: NodeId, status: EventStatus) -> Event {
    Event::new(node.as_str(), status).with_display_name(node.display_name())
}

/// The synthesis engine: backends, normalizer, compiled graph and stores
pub struct Pipeline {
    config: FlowConfig,
    client: Option<Arc<dyn ChatClient>>,
    runner: Option<Arc<dyn ValidationRunner>>,
    normalizer: Normalizer,
    graph: Graph,
    drafts: Arc<DraftStore>,
    checkpoints: Arc<CheckpointStore>,
    session_lane: Arc<SessionLane>,
    global_lane: Arc<GlobalLane>,
    metrics: Arc<MetricsCollector>,
}

impl Pipeline {
    pub fn new(config: FlowConfig) -> Result<Self> {
        let global_lane = Arc::new(GlobalLane::new(config.lanes.global_concurrency));
        Ok(Self {
            config,
            client: None,
            runner: None,
            normalizer: Normalizer::default(),
            graph: Graph::compile()?,
            drafts: Arc::new(DraftStore::new()),
            checkpoints: Arc::new(CheckpointStore::new()),
            session_lane: Arc::new(SessionLane::new()),
            global_lane,
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    pub fn with_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ValidationRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Share a draft store with other pipelines
    pub fn with_draft_store(mut self, drafts: Arc<DraftStore>) -> Self {
        self.drafts = drafts;
        self
    }

    /// Share a global admission lane with other pipelines
    pub fn with_global_lane(mut self, lane: Arc<GlobalLane>) -> Self {
        self.global_lane = lane;
        self
    }

    pub fn with_checkpoint_store(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Share a loop metrics collector with other pipelines
    pub fn with_metrics_collector(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn drafts(&self) -> &Arc<DraftStore> {
        &self.drafts
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub(crate) fn session_lane(&self) -> &SessionLane {
        &self.session_lane
    }

    pub(crate) fn global_lane(&self) -> &GlobalLane {
        &self.global_lane
    }

    pub(crate) fn runner(&self) -> Option<&Arc<dyn ValidationRunner>> {
        self.runner.as_ref()
    }

    pub(crate) fn client(&self) -> Result<&Arc<dyn ChatClient>> {
        self.client.as_ref().ok_or(FlowError::ClientNotConfigured)
    }

    pub(crate) fn new_state(&self, mode: Mode, prompt: &str, opts: &RunOptions) -> SynthesisState {
        SynthesisState::new(
            mode,
            prompt,
            opts,
            (
                self.config.pipeline.max_retries,
                &self.config.pipeline.system_prompt,
            ),
        )
    }

    /// One chat call with the state's system prompt, honoring cancellation
    pub(crate) async fn chat(
        &self,
        opts: &RunOptions,
        system_prompt: &str,
        user_prompt: String,
    ) -> Result<ChatReply> {
        let client = self.client()?;
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_prompt),
        ];
        until_cancelled(&opts.cancel, client.chat_with_thought(&messages)).await
    }

    /// Generate a document from a natural-language request
    #[instrument(skip(self, prompt, opts), fields(prompt_len = prompt.len()))]
    pub async fn run_generate(&self, prompt: &str, opts: &RunOptions) -> RunResult {
        let state = self.new_state(Mode::Generate, prompt, opts);
        self.execute(state, opts).await
    }

    /// Repair a caller-supplied document given its known issues
    #[instrument(skip(self, yaml, issues, opts), fields(yaml_len = yaml.len()))]
    pub async fn run_fix(&self, yaml: &str, issues: &[String], opts: &RunOptions) -> RunResult {
        let mut state = self.new_state(Mode::Fix, "", opts);
        state.yaml = yaml.trim().to_string();
        state.issues = normalize_questions(issues);
        self.execute(state, opts).await
    }

    async fn execute(&self, mut state: SynthesisState, opts: &RunOptions) -> RunResult {
        let emitter = Emitter::new(opts.event_sink.clone());
        let mut node = self.graph.entry();
        let mut transitions = 0;

        while node != NodeId::End {
            if opts.cancel.is_cancelled() {
                return Err(RunError::new(FlowError::Cancelled, state));
            }
            transitions += 1;
            if transitions > Graph::MAX_TRANSITIONS {
                return Err(RunError::new(
                    FlowError::Loop("synthesis graph did not terminate".to_string()),
                    state,
                ));
            }

            debug!("pipeline node {}", node);
            if let Err(e) = self.run_node(node, &mut state, opts, &emitter).await {
                emitter.emit(node_event(node, EventStatus::Error).with_message(e.to_string()));
                return Err(RunError::new(e, state));
            }
            node = self.graph.next(node, &state);
        }

        info!("pipeline finished: {}", state.summary);
        Ok(state)
    }

    async fn run_node(
        &self,
        node: NodeId,
        state: &mut SynthesisState,
        opts: &RunOptions,
        emitter: &Emitter,
    ) -> Result<()> {
        emitter.emit(node_event(node, EventStatus::Start));
        match node {
            NodeId::Normalize => self.normalize_node(state, emitter),
            NodeId::IntentExtract => self.intent_extract_node(state, opts, emitter).await,
            NodeId::QuestionGate => {
                self.question_gate_node(state, emitter);
                Ok(())
            }
            NodeId::Generate => self.generate_node(state, opts, emitter).await,
            NodeId::Validate => {
                self.validate_node(state, emitter);
                Ok(())
            }
            NodeId::Safety => {
                self.safety_node(state, emitter);
                Ok(())
            }
            NodeId::Execute => self.execute_node(state, opts, emitter).await,
            NodeId::Fix => self.fix_node(state, opts, emitter).await,
            NodeId::Summarize => {
                state.summary = format!(
                    "steps={} risk={} issues={}",
                    count_steps(&state.yaml),
                    state.risk_level,
                    state.issues.len()
                );
                emitter.emit(
                    node_event(node, EventStatus::Done).with_message(state.summary.clone()),
                );
                Ok(())
            }
            NodeId::HumanGate => {
                state.needs_review = state.review_required();
                let message = if state.needs_review {
                    "review required"
                } else {
                    "no review required"
                };
                emitter.emit(node_event(node, EventStatus::Done).with_message(message));
                Ok(())
            }
            NodeId::End => Ok(()),
        }
    }

    fn normalize_node(&self, state: &mut SynthesisState, emitter: &Emitter) -> Result<()> {
        match state.mode {
            Mode::Generate if state.prompt.is_empty() => {
                return Err(FlowError::InvalidInput("prompt is required".to_string()));
            }
            Mode::Fix if state.yaml.is_empty() => {
                return Err(FlowError::InvalidInput("yaml is required".to_string()));
            }
            _ => {}
        }
        if state.mode == Mode::Generate && is_greeting_prompt(&state.prompt) {
            debug!("prompt is a greeting, asking for the goal");
            state.intent = Some(Intent::greeting());
        }
        emitter.emit(node_event(NodeId::Normalize, EventStatus::Done));
        Ok(())
    }

    /// Ask the model what the request is about
    ///
    /// Failures other than cancellation are reported and generation goes on
    /// without an intent.
    async fn intent_extract_node(
        &self,
        state: &mut SynthesisState,
        opts: &RunOptions,
        emitter: &Emitter,
    ) -> Result<()> {
        if state.mode != Mode::Generate {
            emitter.emit(
                node_event(NodeId::IntentExtract, EventStatus::Skipped)
                    .with_message("not in generate mode"),
            );
            return Ok(());
        }
        if state.intent.as_ref().is_some_and(Intent::has_missing) {
            emitter.emit(
                node_event(NodeId::IntentExtract, EventStatus::Skipped)
                    .with_message("intent already known"),
            );
            return Ok(());
        }

        let secs = self.config.pipeline.intent_timeout_secs.max(1);
        let prompt = build_intent_prompt(&state.prompt, &state.context);
        let reply = tokio::time::timeout(
            Duration::from_secs(secs),
            self.chat(opts, INTENT_SYSTEM_PROMPT, prompt),
        )
        .await
        .unwrap_or_else(|_| Err(FlowError::Timeout(format!("intent extraction after {}s", secs))));

        match reply.and_then(|reply| parse_intent_reply(&reply.content)) {
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("intent extraction failed: {}", e);
                emitter.emit(
                    node_event(NodeId::IntentExtract, EventStatus::Warning)
                        .with_message(e.to_string()),
                );
                Ok(())
            }
            Ok(intent) => {
                emitter.emit(
                    node_event(NodeId::IntentExtract, EventStatus::Done)
                        .with_data(json!({ "intent": intent })),
                );
                state.intent = Some(intent);
                Ok(())
            }
        }
    }

    fn question_gate_node(&self, state: &mut SynthesisState, emitter: &Emitter) {
        let missing = match &state.intent {
            Some(intent) if state.mode == Mode::Generate && intent.has_missing() => {
                intent.missing.clone()
            }
            _ => {
                emitter.emit(node_event(NodeId::QuestionGate, EventStatus::Skipped));
                return;
            }
        };

        state.questions = merge_questions(&state.questions, &questions_from_missing(&missing));
        state.risk_level = RiskLevel::Low;
        state.is_success = true;
        state.skip_execute = true;
        state.execution_skipped = true;
        emitter.emit(
            node_event(NodeId::QuestionGate, EventStatus::Done)
                .with_message("awaiting missing inputs")
                .with_data(json!({ "questions": state.questions, "missing": missing })),
        );
    }

    async fn generate_node(
        &self,
        state: &mut SynthesisState,
        opts: &RunOptions,
        emitter: &Emitter,
    ) -> Result<()> {
        let prompt = build_generate_prompt(&state.prompt, &state.context);
        let reply = self.chat(opts, &state.system_prompt, prompt).await?;
        state.thought = reply.thought.trim().to_string();

        let extracted = extract_workflow_yaml(&reply.content)?;
        state.yaml = merge_steps_into_base(&state.base_yaml, &extracted.yaml);
        state.questions = merge_questions(&state.questions, &extracted.questions);

        emitter.emit(
            node_event(NodeId::Generate, EventStatus::Done)
                .with_data(json!({ "yaml": state.yaml })),
        );
        Ok(())
    }

    async fn fix_node(
        &self,
        state: &mut SynthesisState,
        opts: &RunOptions,
        emitter: &Emitter,
    ) -> Result<()> {
        if state.mode == Mode::Fix && state.issues.is_empty() && state.last_error.is_empty() {
            emitter.emit(
                node_event(NodeId::Fix, EventStatus::Skipped).with_message("no issues provided"),
            );
            return Ok(());
        }
        if state.retry_count >= state.max_retries {
            emitter.emit(
                node_event(NodeId::Fix, EventStatus::Skipped).with_message("max retries reached"),
            );
            return Ok(());
        }

        let prompt = build_fix_prompt(&state.yaml, &state.issues, &state.last_error);
        let reply = self.chat(opts, &state.system_prompt, prompt).await?;
        state.thought = reply.thought.trim().to_string();

        let extracted = extract_workflow_yaml(&reply.content)?;
        let fixed = merge_steps_into_base(&state.base_yaml, &extracted.yaml);
        let previous = state.yaml.clone();
        if !fixed.trim().is_empty() {
            state.history.push(std::mem::replace(&mut state.yaml, fixed));
        }
        state.questions = merge_questions(&state.questions, &extracted.questions);
        state.retry_count += 1;
        state.last_error.clear();

        emitter.emit(
            node_event(NodeId::Fix, EventStatus::Done)
                .with_message(format!("attempt {}", state.retry_count))
                .with_data(json!({ "yaml": state.yaml, "prev_yaml": previous })),
        );
        Ok(())
    }

    fn validate_node(&self, state: &mut SynthesisState, emitter: &Emitter) {
        let outcome = self.normalizer.normalize(&state.yaml);
        state.yaml = outcome.yaml;
        state.issues = outcome.issues;
        state.notices = merge_questions(&state.notices, &outcome.notices);
        state.risk_level = outcome.risk.level;
        state.risk_notes = outcome.risk.notes;

        if state.issues.is_empty() {
            emitter.emit(node_event(NodeId::Validate, EventStatus::Done));
        } else {
            emitter.emit(
                node_event(NodeId::Validate, EventStatus::Error)
                    .with_message("validation failed")
                    .with_data(json!({ "issues": state.issues })),
            );
        }
    }

    fn safety_node(&self, state: &mut SynthesisState, emitter: &Emitter) {
        let risk = self.normalizer.risk_evaluator().evaluate(&state.yaml);
        state.risk_level = risk.level;
        state.risk_notes = risk.notes;

        if state.risk_level == RiskLevel::High {
            state.skip_execute = true;
            if let Ok(mut wf) = Workflow::load(&state.yaml) {
                if force_manual_approve(&mut wf) {
                    if let Ok(text) = wf.to_yaml() {
                        state.yaml = text;
                    }
                }
            }
        }

        if state.skip_execute || state.env.is_none() || self.runner.is_none() {
            state.execution_skipped = true;
            state.is_success = true;
        }

        emitter.emit(
            node_event(NodeId::Safety, EventStatus::Done)
                .with_message(format!("risk={}", state.risk_level))
                .with_data(json!({ "risk_notes": state.risk_notes })),
        );
    }

    async fn execute_node(
        &self,
        state: &mut SynthesisState,
        opts: &RunOptions,
        emitter: &Emitter,
    ) -> Result<()> {
        let (Some(runner), Some(env)) = (self.runner.clone(), state.env.clone()) else {
            state.execution_skipped = true;
            state.is_success = true;
            emitter.emit(
                node_event(NodeId::Execute, EventStatus::Skipped).with_message("execution skipped"),
            );
            return Ok(());
        };

        match until_cancelled(&opts.cancel, runner.run(&env, &state.yaml)).await {
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                state.is_success = false;
                state.last_error = e.to_string();
                emitter.emit(
                    node_event(NodeId::Execute, EventStatus::Error).with_message(e.to_string()),
                );
            }
            Ok(result) => {
                if result.is_success() {
                    state.is_success = true;
                    emitter.emit(node_event(NodeId::Execute, EventStatus::Done));
                } else {
                    state.is_success = false;
                    state.last_error = match result.stderr.trim() {
                        "" => "execution failed".to_string(),
                        stderr => stderr.to_string(),
                    };
                    emitter.emit(
                        node_event(NodeId::Execute, EventStatus::Error)
                            .with_message(state.last_error.clone()),
                    );
                }
                state.execution = Some(result);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flowsmith_agent::{MockChatClient, MockRunner};
    use flowsmith_core::{EventSink, ExecutionResult, ValidationEnv};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    pub(crate) const INTENT_JSON: &str = r#"{"goal":"install nginx","targets":["web1"],"missing":[]}"#;
    pub(crate) const NGINX_JSON: &str = r#"{"version":"v0.1","name":"install-nginx","inventory":{"hosts":{"web1":{"address":"10.0.0.1"}}},"plan":{"mode":"auto","strategy":"sequential"},"steps":[{"name":"install nginx","action":"cmd.run","with":{"cmd":"apt-get install -y nginx"}}]}"#;
    const BAD_ACTION_JSON: &str = r#"{"version":"v0.1","name":"install-nginx","steps":[{"name":"install nginx","action":"shell.exec","with":{"cmd":"apt-get install -y nginx"}}]}"#;
    const MEDIUM_RISK_JSON: &str = r#"{"version":"v0.1","name":"perms","steps":[{"name":"open perms","action":"cmd.run","with":{"cmd":"chmod 777 /srv/app"}}]}"#;

    pub(crate) fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: EventSink = Arc::new(move |event: Event| {
            captured.lock().unwrap().push(event);
        });
        (sink, seen)
    }

    fn pipeline(client: MockChatClient) -> Pipeline {
        Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(Arc::new(client))
    }

    #[tokio::test]
    async fn test_generate_without_runner() {
        let (sink, events) = collecting_sink();
        let p = pipeline(
            MockChatClient::new()
                .with_reply(INTENT_JSON)
                .with_reply(NGINX_JSON),
        );
        let opts = RunOptions::new().with_event_sink(sink);

        let state = p.run_generate("install nginx", &opts).await.unwrap();
        assert!(state.issues.is_empty(), "{:?}", state.issues);
        assert_eq!(state.risk_level, RiskLevel::Low);
        assert!(state.execution_skipped);
        assert!(state.is_success);
        assert!(!state.needs_review);
        assert_eq!(state.summary, "steps=1 risk=low issues=0");
        assert_eq!(state.intent.as_ref().unwrap().goal, "install nginx");

        let nodes: Vec<(String, EventStatus)> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.status != EventStatus::Start)
            .map(|e| (e.node.clone(), e.status))
            .collect();
        assert_eq!(
            nodes.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec![
                "normalize",
                "intent_extract",
                "question_gate",
                "generator",
                "validator",
                "safety",
                "summarizer",
                "human_gate"
            ]
        );
    }

    #[tokio::test]
    async fn test_fix_cycle_after_invalid_action() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(INTENT_JSON)
                .with_reply(BAD_ACTION_JSON)
                .with_reply(NGINX_JSON),
        );
        let p = Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client.clone());

        let state = p.run_generate("install nginx", &RunOptions::new()).await.unwrap();
        assert!(state.issues.is_empty());
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].contains("shell.exec"));

        let prompts = client.prompts();
        assert!(prompts[2].contains("Issues:\n- steps[0] action \"shell.exec\" is not allowed"));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_keeps_document() {
        let p = pipeline(
            MockChatClient::new()
                .with_reply(INTENT_JSON)
                .with_fallback(BAD_ACTION_JSON),
        );
        let state = p
            .run_generate("install nginx", &RunOptions::new().with_max_retries(1))
            .await
            .unwrap();
        assert_eq!(state.retry_count, 1);
        assert!(!state.issues.is_empty());
        assert!(state.yaml.contains("shell.exec"));
        assert!(state.needs_review);
        assert!(!state.is_success);
    }

    #[tokio::test]
    async fn test_execution_failure_feeds_fix() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(INTENT_JSON)
                .with_reply(NGINX_JSON)
                .with_reply(NGINX_JSON),
        );
        let runner = Arc::new(
            MockRunner::new().with_result(ExecutionResult::failure("E: Unable to locate package", 100)),
        );
        let p = Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client.clone())
            .with_runner(runner.clone());

        let opts = RunOptions::new().with_env(ValidationEnv::new("sandbox"));
        let state = p.run_generate("install nginx", &opts).await.unwrap();

        assert!(state.is_success);
        assert_eq!(state.retry_count, 1);
        assert_eq!(runner.runs().len(), 2);
        assert!(client.prompts()[2].contains("Execution error:\nE: Unable to locate package"));
        assert!(!state.needs_review);
    }

    #[tokio::test]
    async fn test_medium_risk_needs_review() {
        let runner = Arc::new(MockRunner::new());
        let p = pipeline(
            MockChatClient::new()
                .with_reply(INTENT_JSON)
                .with_reply(MEDIUM_RISK_JSON),
        )
        .with_runner(runner);
        let opts = RunOptions::new().with_env(ValidationEnv::new("sandbox"));
        let state = p.run_generate("open permissions", &opts).await.unwrap();
        assert_eq!(state.risk_level, RiskLevel::Medium);
        assert!(!state.execution_skipped);
        assert!(state.needs_review);
    }

    #[tokio::test]
    async fn test_base_document_is_preserved() {
        let base = "version: v0.1\nname: existing\ninventory:\n  hosts:\n    db1:\n      address: 10.0.0.9\nplan:\n  mode: auto\n  strategy: sequential\nsteps: []\n";
        let p = pipeline(
            MockChatClient::new()
                .with_reply(INTENT_JSON)
                .with_reply(NGINX_JSON),
        );
        let state = p
            .run_generate("install nginx", &RunOptions::new().with_base_yaml(base))
            .await
            .unwrap();
        let wf = Workflow::load(&state.yaml).unwrap();
        assert_eq!(wf.name, "existing");
        assert!(wf.inventory.hosts.contains_key("db1"));
        assert_eq!(wf.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_run_fix_mode() {
        let client = Arc::new(MockChatClient::new().with_reply(NGINX_JSON));
        let p = Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client.clone());
        let state = p
            .run_fix(BAD_ACTION_JSON, &["action not allowed".to_string()], &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(state.mode, Mode::Fix);
        assert!(state.issues.is_empty());
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_configuration_and_input_errors() {
        let p = Pipeline::new(FlowConfig::default()).unwrap();
        let err = p.run_generate("install nginx", &RunOptions::new()).await.unwrap_err();
        assert!(matches!(err.error, FlowError::ClientNotConfigured));

        let p = pipeline(MockChatClient::new());
        let err = p.run_generate("   ", &RunOptions::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "prompt is required");

        let err = p.run_fix("", &[], &RunOptions::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "yaml is required");
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let token = CancellationToken::new();
        token.cancel();
        let p = pipeline(MockChatClient::new().with_reply(NGINX_JSON));
        let err = p
            .run_generate("install nginx", &RunOptions::new().with_cancel(token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_greeting_asks_for_goal() {
        let client = Arc::new(MockChatClient::new());
        let (sink, events) = collecting_sink();
        let p = Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client.clone());

        let state = p
            .run_generate("Hello!", &RunOptions::new().with_event_sink(sink))
            .await
            .unwrap();
        assert_eq!(state.questions, vec!["What is the primary goal?".to_string()]);
        assert!(state.yaml.is_empty());
        assert!(state.execution_skipped);
        assert!(client.calls().is_empty());
        assert!(!events.lock().unwrap().iter().any(|e| e.node == "generator"));
    }

    #[tokio::test]
    async fn test_missing_inputs_skip_generation() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply(r#"{"goal":"install nginx","missing":[" Hosts "]}"#)
                .with_fallback(NGINX_JSON),
        );
        let (sink, events) = collecting_sink();
        let runner = Arc::new(MockRunner::new());
        let p = Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client.clone())
            .with_runner(runner.clone());
        let opts = RunOptions::new()
            .with_env(ValidationEnv::new("sandbox"))
            .with_event_sink(sink);

        let state = p.run_generate("install nginx", &opts).await.unwrap();
        assert_eq!(
            state.questions,
            vec!["Which hosts or groups should this run on?".to_string()]
        );
        assert_eq!(client.calls().len(), 1);
        assert!(runner.runs().is_empty());
        assert!(state.is_success);
        assert_eq!(state.risk_level, RiskLevel::Low);

        let events = events.lock().unwrap();
        let gate = events
            .iter()
            .find(|e| e.node == "question_gate" && e.status == EventStatus::Done)
            .unwrap();
        assert_eq!(gate.message, "awaiting missing inputs");
        assert!(!events.iter().any(|e| e.node == "generator"));
    }

    #[tokio::test]
    async fn test_intent_failure_is_not_fatal() {
        let client = Arc::new(
            MockChatClient::new()
                .with_reply("You want nginx installed.")
                .with_reply(NGINX_JSON),
        );
        let (sink, events) = collecting_sink();
        let p = Pipeline::new(FlowConfig::default())
            .unwrap()
            .with_client(client.clone());

        let state = p
            .run_generate("install nginx", &RunOptions::new().with_event_sink(sink))
            .await
            .unwrap();
        assert!(state.intent.is_none());
        assert!(state.issues.is_empty());
        assert!(state.questions.is_empty());
        assert_eq!(client.calls().len(), 2);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.node == "intent_extract" && e.status == EventStatus::Warning));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_during_slow_runner() {
        use flowsmith_agent::CommandRunner;
        use std::time::{Duration, Instant};

        let scripts = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let script = scripts.path().join("slow.sh");
        std::fs::write(&script, "sleep 5\n").unwrap();
        let runner = CommandRunner::from_command_line(&format!("sh {}", script.display()))
            .unwrap()
            .with_scratch_dir(scratch.path());

        let p = pipeline(
            MockChatClient::new()
                .with_reply(INTENT_JSON)
                .with_reply(NGINX_JSON),
        )
        .with_runner(Arc::new(runner));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let opts = RunOptions::new()
            .with_env(ValidationEnv::new("sandbox"))
            .with_cancel(token);
        let started = Instant::now();
        let err = p.run_generate("install nginx", &opts).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.state.yaml.contains("apt-get install -y nginx"));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }
}
