//! Pipeline progress events.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the CLI progress printer, tests) can follow a run without
//! coupling to the coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Rules,
    Expansion,
    Enumeration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Rules => "rules",
            Stage::Expansion => "expansion",
            Stage::Enumeration => "enumeration",
        })
    }
}

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: String,
        source_name: String,
    },
    StageStarted {
        run_id: String,
        stage: Stage,
    },
    StageCompleted {
        run_id: String,
        stage: Stage,
        status: String,
        duration_ms: u64,
    },
    PipelineCompleted {
        run_id: String,
        status: String,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all current subscribers; dropped when nobody listens.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_stage_events() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(PipelineEvent::StageStarted {
            run_id: "r1".into(),
            stage: Stage::Expansion,
        });
        match rx.recv().await.unwrap() {
            PipelineEvent::StageStarted { run_id, stage } => {
                assert_eq!(run_id, "r1");
                assert_eq!(stage, Stage::Expansion);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventEmitter::new(4).emit(PipelineEvent::PipelineCompleted {
            run_id: "r".into(),
            status: "success".into(),
            duration_ms: 1,
        });
    }

    #[test]
    fn stage_serializes_lowercase() {
        let json = serde_json::to_string(&PipelineEvent::StageCompleted {
            run_id: "r".into(),
            stage: Stage::Enumeration,
            status: "timeout".into(),
            duration_ms: 5,
        })
        .unwrap();
        assert!(json.contains("\"stage\":\"enumeration\""));
    }
}
