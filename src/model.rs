use serde::{Deserialize, Serialize};

use crate::error::{CastError, Result};

/// Largest accepted grid dimension per axis.
pub const MAX_GRID_AXIS: u8 = 16;

/// Grid shape of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub rows: u8,
    pub cols: u8,
}

impl GridSize {
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(CastError::Validation(
                "grid dimensions must be at least 1x1".into(),
            ));
        }
        if self.rows > MAX_GRID_AXIS || self.cols > MAX_GRID_AXIS {
            return Err(CastError::Validation(format!(
                "grid dimensions must not exceed {MAX_GRID_AXIS}x{MAX_GRID_AXIS}"
            )));
        }
        Ok(())
    }

    pub fn contains(&self, row: u8, col: u8) -> bool {
        row < self.rows && col < self.cols
    }
}

/// A named button layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,

    /// Display name shown in the configuration selector.
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub grid: GridSize,

    /// Buttons ordered by (row, col).
    #[serde(default)]
    pub buttons: Vec<Button>,

    /// Fallback configuration after the current one is deleted.
    #[serde(default, rename = "default")]
    pub is_default: bool,
}

impl Configuration {
    pub fn button_at(&self, row: u8, col: u8) -> Option<&Button> {
        self.buttons.iter().find(|b| b.row == row && b.col == col)
    }

    pub fn button_by_id(&self, id: &str) -> Option<&Button> {
        self.buttons.iter().find(|b| b.id == id)
    }

    pub fn summary(&self, current: bool) -> ConfigurationSummary {
        ConfigurationSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            grid: self.grid,
            button_count: self.buttons.len(),
            is_default: self.is_default,
            current,
        }
    }
}

/// One-line view of a configuration for list endpoints and push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub grid: GridSize,
    pub button_count: usize,
    #[serde(rename = "default")]
    pub is_default: bool,
    pub current: bool,
}

/// A single cell binding: position, presentation, and the action it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    /// Stable identity, kept across moves. Empty on create; the store mints one.
    #[serde(default)]
    pub id: String,

    pub row: u8,
    pub col: u8,

    /// Text label rendered on the button.
    #[serde(default)]
    pub text: String,

    /// Hex background color, e.g. "#1a1a2e".
    #[serde(default = "default_button_color")]
    pub color: String,

    /// Optional icon name understood by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    pub action: Action,
}

/// An action to execute against the production engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum Action {
    SwitchScene { scene: String },
    StartStream,
    StopStream,
    ToggleStream,
    StartRecord,
    StopRecord,
    ToggleRecord,
    PauseRecord,
    ResumeRecord,
    ToggleRecordPause,
    SetMute { input: String, muted: bool },
    ToggleMute { input: String },
    SetSourceVisibility { source: String, visible: bool },
}

impl Action {
    /// Machine name of the action kind, matching the wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::SwitchScene { .. } => "switch_scene",
            Action::StartStream => "start_stream",
            Action::StopStream => "stop_stream",
            Action::ToggleStream => "toggle_stream",
            Action::StartRecord => "start_record",
            Action::StopRecord => "stop_record",
            Action::ToggleRecord => "toggle_record",
            Action::PauseRecord => "pause_record",
            Action::ResumeRecord => "resume_record",
            Action::ToggleRecordPause => "toggle_record_pause",
            Action::SetMute { .. } => "set_mute",
            Action::ToggleMute { .. } => "toggle_mute",
            Action::SetSourceVisibility { .. } => "set_source_visibility",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let empty = match self {
            Action::SwitchScene { scene } => scene.trim().is_empty(),
            Action::SetMute { input, .. } | Action::ToggleMute { input } => {
                input.trim().is_empty()
            }
            Action::SetSourceVisibility { source, .. } => source.trim().is_empty(),
            _ => false,
        };
        if empty {
            return Err(CastError::Validation(format!(
                "action '{}' requires a non-empty target name",
                self.kind()
            )));
        }
        Ok(())
    }
}

/// Live output state of the production engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub streaming: bool,
    pub recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_scene: Option<String>,
}

// --- Defaults ---

fn default_button_color() -> String {
    "#1a1a2e".to_string()
}
