use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineHandle};
use crate::model::Action;
use crate::store::ConfigStore;

/// Outcome of a button press.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionResult {
    /// The engine accepted the action.
    Success,
    /// The pressed cell holds no button; nothing was done.
    NoButton,
    /// The action ran but the engine refused it, or it timed out.
    Failed { reason: String },
    /// No engine connection right now; nothing was attempted.
    EngineUnreachable,
}

/// Maps pressed grid positions to engine operations.
pub struct Dispatcher {
    store: Arc<ConfigStore>,
    engine: EngineHandle,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<ConfigStore>, engine: EngineHandle, timeout: Duration) -> Self {
        Self {
            store,
            engine,
            timeout,
        }
    }

    /// Resolve `(row, col)` against the configuration that is current at
    /// entry and fire the bound action. A configuration switch happening
    /// concurrently does not retract the decision.
    pub async fn press(&self, row: u8, col: u8) -> ActionResult {
        let config = self.store.current();
        let Some(button) = config.button_at(row, col) else {
            debug!("press at ({row},{col}) hit an empty cell");
            return ActionResult::NoButton;
        };
        info!(
            "press at ({row},{col}): {} [{}]",
            button.id,
            button.action.kind()
        );
        let action = button.action.clone();

        let outcome = tokio::time::timeout(self.timeout, self.run_action(&action)).await;
        let result = match outcome {
            Err(_) => Err(EngineError::Timeout(self.timeout)),
            Ok(result) => result,
        };
        match result {
            Ok(()) => ActionResult::Success,
            Err(EngineError::Unreachable) => {
                debug!("action {} not attempted, engine unreachable", action.kind());
                ActionResult::EngineUnreachable
            }
            Err(e) => {
                warn!("action {} failed: {e}", action.kind());
                ActionResult::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn run_action(&self, action: &Action) -> Result<(), EngineError> {
        match action {
            Action::SwitchScene { scene } => self.engine.switch_scene(scene).await,
            Action::StartStream => self.engine.set_streaming(true).await,
            Action::StopStream => self.engine.set_streaming(false).await,
            Action::ToggleStream => self.engine.toggle_streaming().await,
            Action::StartRecord => self.engine.set_recording(true).await,
            Action::StopRecord => self.engine.set_recording(false).await,
            Action::ToggleRecord => self.engine.toggle_recording().await,
            Action::PauseRecord => self.engine.pause_recording().await,
            Action::ResumeRecord => self.engine.resume_recording().await,
            Action::ToggleRecordPause => self.engine.toggle_recording_pause().await,
            Action::SetMute { input, muted } => self.engine.set_input_mute(input, *muted).await,
            Action::ToggleMute { input } => self.engine.toggle_input_mute(input).await,
            Action::SetSourceVisibility { source, visible } => {
                self.engine.set_source_visibility(source, *visible).await
            }
        }
    }
}
