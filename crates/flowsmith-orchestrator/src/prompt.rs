//! Prompt builders for the synthesis graph and the autonomous loop

use flowsmith_core::tail_strings;

/// Progress-log lines carried into a loop prompt
const PROGRESS_TAIL_LINES: usize = 12;

pub fn build_generate_prompt(prompt: &str, context: &str) -> String {
    let mut out = String::new();
    if !context.trim().is_empty() {
        out.push_str("Context:\n");
        out.push_str(context.trim());
        out.push_str("\n\n");
    }
    out.push_str("User request:\n");
    out.push_str(prompt.trim());
    out.push_str("\n\n");
    out.push_str(
        "Return JSON only. Top-level keys: version, name, description, inventory, vars (optional), plan, steps, handlers (optional).\n",
    );
    out.push_str("Do not include markdown or explanations.");
    out
}

pub fn build_fix_prompt(yaml: &str, issues: &[String], last_error: &str) -> String {
    let mut out = String::new();
    out.push_str("Fix the YAML below and return JSON only with the same schema.\n\n");
    out.push_str("YAML:\n");
    out.push_str(yaml.trim());
    out.push_str("\n\n");
    if !issues.is_empty() {
        out.push_str("Issues:\n");
        for issue in issues {
            out.push_str(&format!("- {}\n", issue));
        }
    }
    if !last_error.trim().is_empty() {
        out.push_str("\nExecution error:\n");
        out.push_str(last_error.trim());
        out.push('\n');
    }
    out.push_str("\nReturn JSON only. Do not include markdown.");
    out
}

/// Inputs for one loop iteration's prompt
#[derive(Debug, Clone, Default)]
pub struct LoopPromptInput<'a> {
    pub prompt: &'a str,
    pub context: &'a str,
    pub base_yaml: &'a str,
    pub tool_names: &'a [String],
    pub history: &'a [String],
    pub iteration: usize,
    pub max_iterations: usize,
    pub ralph: bool,
    pub completion_token: &'a str,
    pub completion_checks: &'a [String],
    pub stop_reasons: &'a [String],
    pub progress: &'a str,
}

/// Build the prompt for one loop iteration
///
/// The caller enforces the size ceiling; this never truncates.
pub fn build_loop_prompt(input: &LoopPromptInput<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are an autonomous workflow agent. Iteration {} of {}.\n",
        input.iteration, input.max_iterations
    ));
    out.push_str("Reply with exactly one JSON object using one of these actions:\n");
    out.push_str("{\"action\":\"tool_call\",\"tool\":\"<name>\",\"args\":{}}\n");
    out.push_str("{\"action\":\"final\",\"yaml\":\"<workflow yaml>\",\"message\":\"...\"}\n");
    out.push_str("{\"action\":\"need_more_info\",\"questions\":[\"...\"],\"message\":\"...\"}\n");
    if input.tool_names.is_empty() {
        out.push_str("Available tools: none.\n");
    } else {
        out.push_str(&format!("Available tools: {}.\n", input.tool_names.join(", ")));
    }
    out.push('\n');

    if !input.context.trim().is_empty() {
        out.push_str("Context:\n");
        out.push_str(input.context.trim());
        out.push_str("\n\n");
    }
    if !input.base_yaml.trim().is_empty() {
        out.push_str("Current workflow YAML:\n");
        out.push_str(input.base_yaml.trim());
        out.push_str("\n\n");
    }
    out.push_str("User request:\n");
    out.push_str(input.prompt.trim());
    out.push_str("\n\n");

    if !input.history.is_empty() {
        out.push_str("Tool history:\n");
        for entry in input.history {
            out.push_str(&format!("- {}\n", entry));
        }
        out.push('\n');
    }

    if input.ralph {
        if !input.completion_checks.is_empty() {
            out.push_str(&format!(
                "Completion checks: {}.\n",
                input.completion_checks.join(", ")
            ));
        }
        if !input.completion_token.trim().is_empty() {
            out.push_str(&format!(
                "When the work is complete, include {} in your final message.\n",
                input.completion_token.trim()
            ));
        }
        if !input.stop_reasons.is_empty() {
            out.push_str("Your last final answer was rejected:\n");
            for reason in input.stop_reasons {
                out.push_str(&format!("- {}\n", reason));
            }
        }
        let lines: Vec<String> = input
            .progress
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if !lines.is_empty() {
            out.push_str("Progress so far:\n");
            for line in tail_strings(&lines, PROGRESS_TAIL_LINES) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out.push('\n');
    }

    out.push_str("Return JSON only. Do not include markdown.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_prompt() {
        let prompt = build_generate_prompt(" install nginx ", "");
        assert!(prompt.starts_with("User request:\ninstall nginx\n\n"));
        assert!(prompt.contains("Top-level keys: version, name"));

        let prompt = build_generate_prompt("install nginx", "hosts: web");
        assert!(prompt.starts_with("Context:\nhosts: web\n\n"));
    }

    #[test]
    fn test_fix_prompt() {
        let prompt = build_fix_prompt(
            "steps: []",
            &["steps is empty".to_string()],
            "exit status 2",
        );
        assert!(prompt.contains("YAML:\nsteps: []\n\n"));
        assert!(prompt.contains("Issues:\n- steps is empty\n"));
        assert!(prompt.contains("\nExecution error:\nexit status 2\n"));
        assert!(prompt.ends_with("Return JSON only. Do not include markdown."));

        let prompt = build_fix_prompt("a: 1", &[], "  ");
        assert!(!prompt.contains("Issues:"));
        assert!(!prompt.contains("Execution error"));
    }

    #[test]
    fn test_loop_prompt_sections() {
        let tools = vec!["validate_workflow".to_string(), "risk_scan".to_string()];
        let history = vec!["tool=risk_scan output=low".to_string()];
        let prompt = build_loop_prompt(&LoopPromptInput {
            prompt: "install nginx",
            tool_names: &tools,
            history: &history,
            iteration: 2,
            max_iterations: 6,
            ..Default::default()
        });
        assert!(prompt.contains("Iteration 2 of 6"));
        assert!(prompt.contains("Available tools: validate_workflow, risk_scan."));
        assert!(prompt.contains("- tool=risk_scan output=low"));
        assert!(!prompt.contains("Progress so far"));
    }

    #[test]
    fn test_loop_prompt_ralph_memory() {
        let checks = vec!["has_steps".to_string()];
        let reasons = vec!["has_steps: workflow steps are missing".to_string()];
        let progress: String = (1..=20).map(|i| format!("line {}\n", i)).collect();
        let prompt = build_loop_prompt(&LoopPromptInput {
            prompt: "install nginx",
            iteration: 1,
            max_iterations: 6,
            ralph: true,
            completion_token: "<promise>DONE</promise>",
            completion_checks: &checks,
            stop_reasons: &reasons,
            progress: &progress,
            ..Default::default()
        });
        assert!(prompt.contains("Completion checks: has_steps."));
        assert!(prompt.contains("<promise>DONE</promise>"));
        assert!(prompt.contains("- has_steps: workflow steps are missing"));
        assert!(prompt.contains("line 20\n"));
        assert!(!prompt.contains("line 8\n"));
        assert!(prompt.contains("Available tools: none."));
    }
}
