//! Requirements record kept in loop memory (`prd.json`)

use serde::{Deserialize, Serialize};

/// A branch name plus the user stories a loop must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_stories: Vec<UserStory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStory {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub priority: i32,
    #[serde(default)]
    pub passes: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl UserStory {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_passes(mut self, passes: bool) -> Self {
        self.passes = passes;
        self
    }
}

impl Requirements {
    /// Stories that have not passed yet
    pub fn pending(&self) -> impl Iterator<Item = &UserStory> {
        self.user_stories.iter().filter(|s| !s.passes)
    }

    /// True only when there is at least one story and every story passes
    pub fn all_pass(&self) -> bool {
        !self.user_stories.is_empty() && self.user_stories.iter().all(|s| s.passes)
    }
}
