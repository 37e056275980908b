//! Tracking configuration handed to child processes.
//!
//! The harness never mutates its own environment. Setup resolves the tracking
//! endpoint and experiment into a [`TrackingEnv`], and every phase that spawns
//! a child applies it to that child's `Command`.

use std::process::Command;

pub const TRACKING_URI_VAR: &str = "MLFLOW_TRACKING_URI";
pub const EXPERIMENT_ID_VAR: &str = "MLFLOW_EXPERIMENT_ID";
pub const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEnv {
    pub tracking_uri: String,
    pub experiment_id: Option<String>,
    pub openai_api_key: Option<String>,
}

impl TrackingEnv {
    pub fn new(tracking_uri: impl Into<String>) -> Self {
        Self {
            tracking_uri: tracking_uri.into(),
            experiment_id: None,
            openai_api_key: None,
        }
    }

    pub fn with_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    pub fn with_openai_api_key(mut self, key: Option<String>) -> Self {
        self.openai_api_key = key;
        self
    }

    /// Variables this environment contributes, in a stable order.
    pub fn vars(&self) -> Vec<(&'static str, &str)> {
        let mut vars = vec![(TRACKING_URI_VAR, self.tracking_uri.as_str())];
        if let Some(id) = &self.experiment_id {
            vars.push((EXPERIMENT_ID_VAR, id.as_str()));
        }
        if let Some(key) = &self.openai_api_key {
            vars.push((OPENAI_API_KEY_VAR, key.as_str()));
        }
        vars
    }

    pub fn apply(&self, cmd: &mut Command) {
        for (key, value) in self.vars() {
            cmd.env(key, value);
        }
    }
}
