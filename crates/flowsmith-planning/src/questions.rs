//! Follow-up questions for missing information

use flowsmith_core::dedupe_strings;

const MISSING_QUESTIONS: &[(&str, &str)] = &[
    ("targets", "Which hosts or environments should this run on?"),
    ("hosts", "Which hosts or groups should this run on?"),
    ("inventory", "Do you want to use a specific inventory or environment?"),
    ("env", "Do you need any environment variables or env packages?"),
    ("env_packages", "Which env packages should be applied?"),
    ("validation_env", "Which validation environment should be used?"),
    ("constraints", "Any constraints such as OS, package manager, or network limits?"),
    ("resources", "Any scripts, templates, or configs that should be used?"),
    ("actions", "What actions or steps should be included?"),
    ("plan", "Should the plan be manual-approve or auto?"),
    ("approval", "Should this require manual approval?"),
    ("credentials", "Any credentials or secrets needed (do not paste secrets here)?"),
    ("schedule", "Is there a preferred schedule or window?"),
    ("requirements", "Any additional requirements to include?"),
    ("output", "What outputs should be verified?"),
    ("verification", "How should the workflow be verified?"),
    ("rollback", "Is a rollback or cleanup needed?"),
    ("scope", "What is the scope or boundary of this change?"),
    ("dependencies", "Are there dependencies or prerequisites to consider?"),
    ("service", "Which service or package should be managed?"),
    ("config", "Do you have config paths or template locations?"),
    ("command", "What command should be executed?"),
    ("goal", "What is the primary goal?"),
    ("description", "Any description or context to include?"),
    ("steps", "Are there specific steps or sequence requirements?"),
    ("risk", "Any risk constraints or safeguards?"),
    ("timeout", "Any timeout or retry requirements?"),
    ("language", "What script language should be used?"),
    ("runtime", "Any runtime or environment constraints?"),
    ("package_manager", "Which package manager should be used?"),
    ("os", "Which OS or distribution should this target?"),
    ("version", "Any version constraints?"),
    ("ports", "Any ports or endpoints involved?"),
    ("files", "Any files that need to be created or modified?"),
    ("paths", "Any file paths to reference?"),
    ("users", "Any users or permissions to consider?"),
    ("policy", "Any policy or compliance requirements?"),
    ("monitoring", "Should monitoring or alerts be added?"),
    ("notifications", "Who should be notified?"),
    ("confirm", "Is confirmation required for any step?"),
];

/// Lowercase, trim and dedupe missing-information keys
pub fn normalize_missing(missing: &[String]) -> Vec<String> {
    dedupe_strings(missing.iter().map(|m| m.trim().to_lowercase()))
}

/// Question for one missing key; unknown keys get a generic prompt
pub fn question_for(key: &str) -> String {
    MISSING_QUESTIONS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, q)| q.to_string())
        .unwrap_or_else(|| format!("Please provide: {}.", key))
}

pub fn questions_from_missing(missing: &[String]) -> Vec<String> {
    dedupe_strings(normalize_missing(missing).iter().map(|k| question_for(k)))
}

/// Whether the user explicitly asked to be asked for missing details
pub fn should_ask_questions(prompt: &str, phrases: &[String]) -> bool {
    let normalized = prompt.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| normalized.contains(&p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsmith_core::MultiAgentConfig;

    #[test]
    fn test_questions_from_missing() {
        let missing = vec![
            "Targets".to_string(),
            "targets".to_string(),
            " ".to_string(),
            "db_password".to_string(),
        ];
        assert_eq!(
            questions_from_missing(&missing),
            vec![
                "Which hosts or environments should this run on?".to_string(),
                "Please provide: db_password.".to_string(),
            ]
        );
    }

    #[test]
    fn test_should_ask_questions() {
        let phrases = MultiAgentConfig::default().question_phrases;
        assert!(should_ask_questions(
            "Install nginx, please ASK ME what's missing",
            &phrases
        ));
        assert!(should_ask_questions("部署服务，不清楚端口", &phrases));
        assert!(!should_ask_questions("install nginx", &phrases));
        assert!(!should_ask_questions("", &phrases));
    }
}
