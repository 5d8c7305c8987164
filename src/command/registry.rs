// src/command/registry.rs

//! The command container: an immutable name-to-handler mapping built at
//! setup, rebuilt copy-on-write when loaders push updates, and published by
//! an atomic reference swap so dispatch never locks.

use super::{Command, CommandFilter};
use crate::errors::PorticoError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// One registered command with its resolved filter chain.
#[derive(Clone)]
pub struct CommandEntry {
    pub handler: Arc<dyn Command>,
    pub filters: Vec<Arc<dyn CommandFilter>>,
}

/// An immutable command mapping. Lookups are case-insensitive.
#[derive(Default)]
pub struct CommandContainer {
    entries: HashMap<String, CommandEntry>,
}

impl CommandContainer {
    /// Discovers commands through every loader and resolves each command's
    /// filter chain (global filters first, then the handler's own).
    /// Duplicate names are fatal.
    pub fn build(
        loaders: &[Arc<dyn CommandLoader>],
        global_filters: &[Arc<dyn CommandFilter>],
    ) -> Result<Self, PorticoError> {
        let mut container = Self::default();
        for loader in loaders {
            for command in loader.load()? {
                container.insert_new(command, global_filters)?;
            }
        }
        Ok(container)
    }

    fn insert_new(
        &mut self,
        command: Arc<dyn Command>,
        global_filters: &[Arc<dyn CommandFilter>],
    ) -> Result<(), PorticoError> {
        let key = command.name().to_ascii_lowercase();
        if self.entries.contains_key(&key) {
            return Err(PorticoError::DuplicateCommand(command.name().to_string()));
        }
        self.entries.insert(key, resolve_entry(command, global_filters));
        Ok(())
    }

    /// A copy of this container with a batch of loader updates applied.
    pub fn with_updates(
        &self,
        updates: Vec<CommandUpdate>,
        global_filters: &[Arc<dyn CommandFilter>],
    ) -> Self {
        let mut entries = self.entries.clone();
        for update in updates {
            match update {
                CommandUpdate::Add(command) | CommandUpdate::Update(command) => {
                    let key = command.name().to_ascii_lowercase();
                    entries.insert(key, resolve_entry(command, global_filters));
                }
                CommandUpdate::Remove(name) => {
                    if entries.remove(&name.to_ascii_lowercase()).is_none() {
                        warn!(command = %name, "removal of a command that is not registered");
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn lookup(&self, key: &str) -> Option<&CommandEntry> {
        self.entries.get(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.values().map(|e| e.handler.name()).collect()
    }
}

fn resolve_entry(
    command: Arc<dyn Command>,
    global_filters: &[Arc<dyn CommandFilter>],
) -> CommandEntry {
    let mut filters = global_filters.to_vec();
    filters.extend(command.filters());
    CommandEntry {
        handler: command,
        filters,
    }
}

/// A change pushed by a loader after the initial discovery.
pub enum CommandUpdate {
    Add(Arc<dyn Command>),
    Update(Arc<dyn Command>),
    Remove(String),
}

/// Supplies command handlers at setup and, optionally, update batches at
/// runtime through the channel handed to `attach_update_channel`.
pub trait CommandLoader: Send + Sync {
    fn load(&self) -> Result<Vec<Arc<dyn Command>>, PorticoError>;

    /// Loaders that push runtime updates keep the sender; the default loader
    /// ignores it.
    fn attach_update_channel(&self, _updates: mpsc::Sender<Vec<CommandUpdate>>) {}
}

/// The explicit registry builder: a fixed set of commands handed over in code.
pub struct StaticCommandLoader {
    commands: Vec<Arc<dyn Command>>,
}

impl StaticCommandLoader {
    pub fn new(commands: Vec<Arc<dyn Command>>) -> Self {
        Self { commands }
    }
}

impl CommandLoader for StaticCommandLoader {
    fn load(&self) -> Result<Vec<Arc<dyn Command>>, PorticoError> {
        Ok(self.commands.clone())
    }
}
