//! Replays a fixed list of decisions.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};

use super::decision::{Decision, DecisionContext, DecisionFunction};

#[derive(Deserialize)]
struct ScriptFile {
    decisions: Vec<Decision>,
    #[serde(default)]
    repeat_last: bool,
}

/// Returns recorded decisions in order.
///
/// Once the list is used up, the last decision is repeated if `repeat_last`
/// is set; otherwise further turns fail with [`Error::Decision`].
pub struct ScriptedDecision {
    queue: Mutex<VecDeque<Decision>>,
    last: Mutex<Option<Decision>>,
    repeat_last: bool,
}

impl ScriptedDecision {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            queue: Mutex::new(decisions.into()),
            last: Mutex::new(None),
            repeat_last: false,
        }
    }

    /// Keeps returning the final decision once the script runs out.
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Parses a YAML script:
    ///
    /// ```yaml
    /// repeat_last: false
    /// decisions:
    ///   - type: call
    ///     name: read_file
    ///     arguments: { path: app/models.py }
    ///   - type: finish
    ///     answer: Added the missing field.
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: ScriptFile = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid decision script: {}", e)))?;
        let script = Self::new(file.decisions);
        Ok(if file.repeat_last {
            script.repeat_last()
        } else {
            script
        })
    }

    /// Reads a YAML script from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&yaml)
    }

    /// Number of decisions not yet returned.
    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DecisionFunction for ScriptedDecision {
    async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision> {
        let next = self
            .queue
            .lock()
            .map_err(|_| Error::Decision("decision script poisoned".to_string()))?
            .pop_front();
        let mut last = self
            .last
            .lock()
            .map_err(|_| Error::Decision("decision script poisoned".to_string()))?;

        match next {
            Some(decision) => {
                *last = Some(decision.clone());
                Ok(decision)
            }
            None if self.repeat_last => last
                .clone()
                .ok_or_else(|| Error::Decision("decision script is empty".to_string())),
            None => Err(Error::Decision(format!(
                "decision script exhausted at attempt {}",
                context.attempt
            ))),
        }
    }

    fn name(&self) -> &str {
        "script"
    }
}
