use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::convergence::LoopSettings;
use crate::error::{GenerationError, GenerationFailure};
use crate::generation::{GenerationRole, GenerationService};

type Reply = Result<String, GenerationError>;

/// Generation service replaying queued replies per role.
/// An empty analyze queue answers "No issues found."; an empty fix queue fails.
#[derive(Default)]
pub struct ScriptedGeneration {
    analyze: Mutex<VecDeque<Reply>>,
    fix: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(GenerationRole, String)>>,
}

impl ScriptedGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analyze(mut self, reply: &str) -> Self {
        self.analyze.get_mut().unwrap().push_back(Ok(reply.to_string()));
        self
    }

    pub fn analyze_err(mut self, err: GenerationError) -> Self {
        self.analyze.get_mut().unwrap().push_back(Err(err));
        self
    }

    pub fn fix(mut self, reply: &str) -> Self {
        self.fix.get_mut().unwrap().push_back(Ok(reply.to_string()));
        self
    }

    pub fn count(&self, role: GenerationRole) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .count()
    }
}

impl GenerationService for ScriptedGeneration {
    async fn generate(&self, prompt: &str, role: GenerationRole) -> Reply {
        self.calls.lock().unwrap().push((role, prompt.to_string()));
        let next = match role {
            GenerationRole::Analyze => self.analyze.lock().unwrap().pop_front(),
            GenerationRole::Fix => self.fix.lock().unwrap().pop_front(),
        };
        next.unwrap_or_else(|| match role {
            GenerationRole::Analyze => Ok("No issues found.".to_string()),
            GenerationRole::Fix => Err(GenerationError::new(
                GenerationFailure::Malformed,
                "no scripted fix reply",
            )),
        })
    }
}

pub fn fast_settings(max_iterations: u32) -> LoopSettings {
    LoopSettings {
        max_iterations,
        step_timeout: Some(Duration::from_secs(5)),
        rate_limit_retries: 2,
        initial_backoff: Duration::from_millis(1),
    }
}
