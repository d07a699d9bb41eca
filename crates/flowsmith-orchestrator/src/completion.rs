//! Completion checks gating a `final` answer in the ralph profile

use flowsmith_agent::LoopAction;
use flowsmith_core::{tail_strings, RiskLevel};
use flowsmith_memory::LoopMemorySnapshot;
use flowsmith_metrics::CompletionCheckResult;
use flowsmith_validation::steps_only_yaml;

pub const CHECK_YAML_NON_EMPTY: &str = "yaml_non_empty";
pub const CHECK_HAS_STEPS: &str = "has_steps";
pub const CHECK_NO_HIGH_RISK: &str = "no_high_risk";
pub const CHECK_PRD_ALL_PASS: &str = "prd_all_pass";
pub const CHECK_TESTS_GREEN: &str = "tests_green";
pub const CHECK_COMPLETION_TOKEN: &str = "completion_token";

/// Tool history lines inspected by `tests_green`
const GREEN_SIGNAL_WINDOW: usize = 4;

/// Outcome of evaluating every configured check against one `final`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionEvaluation {
    pub passed: bool,
    pub checks: Vec<CompletionCheckResult>,
    /// `name: reason` per failing check
    pub failed: Vec<String>,
}

/// What a `final` is judged against
pub struct CompletionInput<'a> {
    pub action: &'a LoopAction,
    pub reply: &'a str,
    pub yaml: &'a str,
    pub risk: RiskLevel,
    pub snapshot: &'a LoopMemorySnapshot,
}

/// Run the configured checks
///
/// With no checks and no token configured every `final` passes. Check names
/// are case-insensitive; unknown names always fail.
pub fn evaluate_completion(
    checks: &[String],
    token: &str,
    input: &CompletionInput<'_>,
) -> CompletionEvaluation {
    let mut results = Vec::new();
    let token = token.trim();

    if !token.is_empty() {
        let found = input
            .action
            .texts()
            .into_iter()
            .chain([input.reply, input.yaml])
            .any(|text| text.contains(token));
        results.push(if found {
            CompletionCheckResult::pass(CHECK_COMPLETION_TOKEN)
        } else {
            CompletionCheckResult::fail(CHECK_COMPLETION_TOKEN, "completion token not found")
        });
    }

    for name in checks {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        results.push(run_check(&name, input));
    }

    let failed: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| format!("{}: {}", r.name, r.reason))
        .collect();

    CompletionEvaluation {
        passed: failed.is_empty(),
        checks: results,
        failed,
    }
}

fn run_check(name: &str, input: &CompletionInput<'_>) -> CompletionCheckResult {
    let verdict: Result<(), &str> = match name {
        CHECK_YAML_NON_EMPTY => {
            if input.yaml.trim().is_empty() {
                Err("yaml is empty")
            } else {
                Ok(())
            }
        }
        CHECK_HAS_STEPS => {
            let steps = steps_only_yaml(input.yaml);
            if steps.is_empty() || !steps.contains("- name:") {
                Err("workflow steps are missing")
            } else {
                Ok(())
            }
        }
        CHECK_NO_HIGH_RISK => {
            if input.risk == RiskLevel::High {
                Err("risk level is high")
            } else {
                Ok(())
            }
        }
        CHECK_PRD_ALL_PASS => {
            let requirements = &input.snapshot.requirements;
            if requirements.user_stories.is_empty() {
                Err("no user stories in prd")
            } else if !requirements.all_pass() {
                Err("not all PRD stories pass")
            } else {
                Ok(())
            }
        }
        CHECK_TESTS_GREEN => {
            if has_green_signal(&input.snapshot.checkpoint.tool_history) {
                Ok(())
            } else {
                Err("no green test signal found")
            }
        }
        _ => Err("unknown completion check"),
    };

    match verdict {
        Ok(()) => CompletionCheckResult::pass(name),
        Err(reason) => CompletionCheckResult::fail(name, reason),
    }
}

fn has_green_signal(history: &[String]) -> bool {
    let recent = tail_strings(history, GREEN_SIGNAL_WINDOW).join("\n").to_lowercase();
    if recent.contains("fail") || recent.contains("error") {
        return false;
    }
    recent.contains("pass") || recent.contains("ok")
}
