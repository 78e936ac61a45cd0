//! Scripted router used by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::router::{AnalysisResponse, AnalysisRouter, AnalysisTask, RouterError};

#[derive(Clone)]
enum Script {
    Respond(AnalysisResponse),
    Fail(RouterError),
    Delay(Duration, AnalysisResponse),
}

/// Answers per backend name; unknown backends are unavailable
#[derive(Default)]
pub(crate) struct ScriptedRouter {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<AnalysisTask>>,
}

impl ScriptedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, backend: &str, response: AnalysisResponse) -> Self {
        self.scripts.insert(backend.to_string(), Script::Respond(response));
        self
    }

    pub fn fail(mut self, backend: &str) -> Self {
        self.scripts.insert(
            backend.to_string(),
            Script::Fail(RouterError::Transport("connection refused".into())),
        );
        self
    }

    pub fn delayed(mut self, backend: &str, delay: Duration, response: AnalysisResponse) -> Self {
        self.scripts
            .insert(backend.to_string(), Script::Delay(delay, response));
        self
    }

    pub fn calls(&self) -> Vec<AnalysisTask> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl AnalysisRouter for ScriptedRouter {
    async fn route(&self, task: AnalysisTask) -> Result<AnalysisResponse, RouterError> {
        self.calls.lock().push(task.clone());
        match self.scripts.get(&task.backend).cloned() {
            Some(Script::Respond(resp)) => Ok(resp),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Delay(delay, resp)) => {
                tokio::time::sleep(delay).await;
                Ok(resp)
            }
            None => Err(RouterError::Unavailable(task.backend)),
        }
    }
}
