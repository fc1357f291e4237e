use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CastError, Result};
use crate::model::{Action, Button, Configuration, ConfigurationSummary, GridSize};

/// New configuration request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateConfiguration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub grid: GridSize,
    #[serde(default, rename = "default")]
    pub is_default: bool,
}

/// Partial configuration update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateConfiguration {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "default")]
    pub is_default: Option<bool>,
}

/// On-disk shape of the store.
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    current: String,
    configurations: Vec<Configuration>,
}

#[derive(Debug)]
struct StoreState {
    /// Insertion-ordered; listing and the on-disk document follow this order.
    configs: Vec<Configuration>,
    current_id: String,
    next_id: u64,
}

impl StoreState {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.configs.iter().position(|c| c.id == id)
    }

    fn get(&self, id: &str) -> Option<&Configuration> {
        self.configs.iter().find(|c| c.id == id)
    }

    fn current(&self) -> &Configuration {
        // current_id always names a member; every mutation re-establishes this.
        self.configs
            .iter()
            .find(|c| c.id == self.current_id)
            .unwrap_or(&self.configs[0])
    }

    fn mint_config_id(&mut self) -> String {
        loop {
            let id = format!("cfg-{}", self.next_id);
            self.next_id += 1;
            if self.get(&id).is_none() {
                return id;
            }
        }
    }
}

/// Holds every button layout, the pointer to the active one, and the JSON
/// document both are persisted to. All mutations validate first and write
/// through on success.
pub struct ConfigStore {
    inner: RwLock<StoreState>,
    /// Snapshot of the active configuration for lock-free reads on the press path.
    current: ArcSwap<Configuration>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Open the store at `path`, seeding a default configuration on first run.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let doc: StoreDocument = serde_json::from_str(&content)
                .map_err(|e| CastError::Store(format!("{}: {e}", path.display())))?;
            state_from_document(doc)
        } else {
            info!("no store at {}, seeding default configuration", path.display());
            seed_state()
        };

        let store = Self {
            current: ArcSwap::from_pointee(state.current().clone()),
            inner: RwLock::new(state),
            path: Some(path),
        };
        store.persist(&store.read());
        Ok(store)
    }

    /// Store backed by memory only. Used by tests and `--check`.
    pub fn in_memory() -> Self {
        let state = seed_state();
        Self {
            current: ArcSwap::from_pointee(state.current().clone()),
            inner: RwLock::new(state),
            path: None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active configuration snapshot. Never blocks on store mutations.
    pub fn current(&self) -> Arc<Configuration> {
        self.current.load_full()
    }

    pub fn current_id(&self) -> String {
        self.read().current_id.clone()
    }

    pub fn count(&self) -> usize {
        self.read().configs.len()
    }

    pub fn list(&self) -> Vec<ConfigurationSummary> {
        let state = self.read();
        state
            .configs
            .iter()
            .map(|c| c.summary(c.id == state.current_id))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Configuration> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| CastError::NotFound(format!("configuration '{id}'")))
    }

    pub fn create(&self, req: CreateConfiguration) -> Result<Configuration> {
        if req.name.trim().is_empty() {
            return Err(CastError::Validation(
                "configuration name must not be empty".into(),
            ));
        }
        req.grid.validate()?;

        let mut state = self.write();
        let id = state.mint_config_id();
        let config = Configuration {
            id,
            name: req.name.trim().to_string(),
            description: req.description,
            grid: req.grid,
            buttons: Vec::new(),
            is_default: req.is_default,
        };
        if config.is_default {
            clear_default_flags(&mut state.configs);
        }
        state.configs.push(config.clone());
        self.commit(&state);
        info!("created configuration '{}' ({})", config.name, config.id);
        Ok(config)
    }

    pub fn update(&self, id: &str, req: UpdateConfiguration) -> Result<Configuration> {
        if let Some(name) = &req.name {
            if name.trim().is_empty() {
                return Err(CastError::Validation(
                    "configuration name must not be empty".into(),
                ));
            }
        }

        let mut state = self.write();
        let idx = state
            .index_of(id)
            .ok_or_else(|| CastError::NotFound(format!("configuration '{id}'")))?;

        if req.is_default == Some(true) {
            clear_default_flags(&mut state.configs);
        }
        let config = &mut state.configs[idx];
        if let Some(name) = req.name {
            config.name = name.trim().to_string();
        }
        if let Some(description) = req.description {
            config.description = description;
        }
        if let Some(is_default) = req.is_default {
            config.is_default = is_default;
        }
        let updated = config.clone();
        self.commit(&state);
        Ok(updated)
    }

    /// Delete a configuration. Returns the newly current configuration when
    /// the deletion moved the current pointer.
    pub fn delete(&self, id: &str) -> Result<Option<Configuration>> {
        let mut state = self.write();
        let idx = state
            .index_of(id)
            .ok_or_else(|| CastError::NotFound(format!("configuration '{id}'")))?;
        if state.configs.len() == 1 {
            return Err(CastError::Validation(
                "cannot delete the last remaining configuration".into(),
            ));
        }

        let removed = state.configs.remove(idx);
        let repointed = if state.current_id == removed.id {
            let fallback = state
                .configs
                .iter()
                .find(|c| c.is_default)
                .unwrap_or(&state.configs[0])
                .clone();
            state.current_id = fallback.id.clone();
            info!(
                "deleted current configuration '{}', now serving '{}'",
                removed.id, fallback.id
            );
            Some(fallback)
        } else {
            info!("deleted configuration '{}'", removed.id);
            None
        };
        self.commit(&state);
        Ok(repointed)
    }

    pub fn set_current(&self, id: &str) -> Result<Configuration> {
        let mut state = self.write();
        let config = state
            .get(id)
            .cloned()
            .ok_or_else(|| CastError::NotFound(format!("configuration '{id}'")))?;
        state.current_id = config.id.clone();
        self.commit(&state);
        info!("current configuration set to '{}'", config.id);
        Ok(config)
    }

    /// Insert or replace a button. An empty `id` mints one from the position;
    /// a given `id` updates that button (or inserts under the given id).
    pub fn upsert_button(&self, config_id: &str, mut button: Button) -> Result<Configuration> {
        validate_button_id(&button.id)?;
        button.action.validate()?;

        let mut state = self.write();
        let idx = state
            .index_of(config_id)
            .ok_or_else(|| CastError::NotFound(format!("configuration '{config_id}'")))?;
        let config = &state.configs[idx];

        if !config.grid.contains(button.row, button.col) {
            return Err(CastError::Validation(format!(
                "position ({},{}) is outside the {}x{} grid",
                button.row, button.col, config.grid.rows, config.grid.cols
            )));
        }
        let occupied = config
            .buttons
            .iter()
            .any(|b| b.row == button.row && b.col == button.col && b.id != button.id);
        if occupied {
            return Err(CastError::Validation(format!(
                "position ({},{}) is already occupied",
                button.row, button.col
            )));
        }

        if button.id.is_empty() {
            button.id = mint_button_id(config, button.row, button.col);
        }

        let config = &mut state.configs[idx];
        match config.buttons.iter().position(|b| b.id == button.id) {
            Some(pos) => config.buttons[pos] = button,
            None => config.buttons.push(button),
        }
        config.buttons.sort_by_key(|b| (b.row, b.col));
        let updated = config.clone();
        self.commit(&state);
        Ok(updated)
    }

    pub fn delete_button(&self, config_id: &str, button_id: &str) -> Result<Configuration> {
        let mut state = self.write();
        let idx = state
            .index_of(config_id)
            .ok_or_else(|| CastError::NotFound(format!("configuration '{config_id}'")))?;
        let config = &mut state.configs[idx];
        let pos = config
            .buttons
            .iter()
            .position(|b| b.id == button_id)
            .ok_or_else(|| {
                CastError::NotFound(format!("button '{button_id}' in '{config_id}'"))
            })?;
        config.buttons.remove(pos);
        let updated = config.clone();
        self.commit(&state);
        Ok(updated)
    }

    /// Refresh the current snapshot and write the document through to disk.
    /// The in-memory state is authoritative; a failed write is logged and
    /// retried on the next mutation.
    fn commit(&self, state: &StoreState) {
        self.current.store(Arc::new(state.current().clone()));
        self.persist(state);
    }

    fn persist(&self, state: &StoreState) {
        let Some(path) = &self.path else {
            return;
        };
        let doc = StoreDocument {
            current: state.current_id.clone(),
            configurations: state.configs.clone(),
        };
        if let Err(e) = write_document(path, &doc) {
            warn!("failed to persist store to {}: {e}", path.display());
        }
    }
}

fn write_document(path: &Path, doc: &StoreDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn state_from_document(doc: StoreDocument) -> StoreState {
    if doc.configurations.is_empty() {
        warn!("store document holds no configurations, seeding default");
        return seed_state();
    }

    let next_id = doc
        .configurations
        .iter()
        .filter_map(|c| c.id.strip_prefix("cfg-"))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
        + 1;
    let current_id = if doc.configurations.iter().any(|c| c.id == doc.current) {
        doc.current
    } else {
        warn!("current configuration '{}' not in store, using first", doc.current);
        doc.configurations[0].id.clone()
    };

    StoreState {
        configs: doc.configurations,
        current_id,
        next_id,
    }
}

fn seed_state() -> StoreState {
    let seed = Configuration {
        id: "cfg-1".to_string(),
        name: "Default".to_string(),
        description: "Starter 3x5 layout".to_string(),
        grid: GridSize { rows: 3, cols: 5 },
        buttons: vec![
            Button {
                id: "btn-0-0".to_string(),
                row: 0,
                col: 0,
                text: "Go Live".to_string(),
                color: "#c0392b".to_string(),
                icon: None,
                action: Action::ToggleStream,
            },
            Button {
                id: "btn-0-1".to_string(),
                row: 0,
                col: 1,
                text: "Record".to_string(),
                color: "#1a1a2e".to_string(),
                icon: None,
                action: Action::ToggleRecord,
            },
        ],
        is_default: true,
    };
    StoreState {
        current_id: seed.id.clone(),
        configs: vec![seed],
        next_id: 2,
    }
}

fn clear_default_flags(configs: &mut [Configuration]) {
    for config in configs {
        config.is_default = false;
    }
}

fn mint_button_id(config: &Configuration, row: u8, col: u8) -> String {
    let base = format!("btn-{row}-{col}");
    if config.button_by_id(&base).is_none() {
        return base;
    }
    let mut n = 2;
    loop {
        let id = format!("{base}-{n}");
        if config.button_by_id(&id).is_none() {
            return id;
        }
        n += 1;
    }
}

fn validate_button_id(id: &str) -> Result<()> {
    let ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CastError::Validation(format!(
            "button id '{id}' may only contain alphanumerics, '-' and '_'"
        )))
    }
}
