//! In-process state store with optional JSON persistence

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::{ObjectDescriptor, State, StateCommand, StateStore};
use crate::config::write_atomic;
use pb_error::{PibridgeError, Result};
use pb_protocol::StateValue;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tree {
    #[serde(default)]
    objects: BTreeMap<String, ObjectDescriptor>,
    #[serde(default)]
    states: BTreeMap<String, State>,
}

/// State tree kept in memory.
///
/// When opened with a file, [`MemoryStore::flush`] persists the tree so
/// values (notably the last level of plain outputs) survive restarts.
pub struct MemoryStore {
    tree: RwLock<Tree>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
    commands_tx: mpsc::UnboundedSender<StateCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<StateCommand>>>,
}

impl MemoryStore {
    /// Store that lives only as long as the process
    pub fn new() -> Self {
        Self::with_tree(Tree::default(), None)
    }

    /// Store backed by `path`; an existing file is loaded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tree = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| PibridgeError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            let tree: Tree = serde_json::from_str(&content).map_err(|e| {
                PibridgeError::store(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            info!(
                path = %path.display(),
                objects = tree.objects.len(),
                states = tree.states.len(),
                "State tree loaded"
            );
            tree
        } else {
            Tree::default()
        };
        Ok(Self::with_tree(tree, Some(path)))
    }

    fn with_tree(tree: Tree, path: Option<PathBuf>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            tree: RwLock::new(tree),
            path,
            dirty: AtomicBool::new(false),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the tree to its file if anything changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let json = {
            let tree = self.tree.read();
            serde_json::to_string_pretty(&*tree)?
        };
        if let Err(e) = write_atomic(path, json.as_bytes()) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(path = %path.display(), "State tree flushed");
        Ok(())
    }

    /// External write: forwarded to the adapter, which acknowledges it by
    /// writing the accepted level. The tree is left untouched, so a rejected
    /// write leaves no trace.
    ///
    /// Only existing, writable states accept commands.
    pub fn command(&self, path: &str, value: StateValue) -> Result<()> {
        match self.tree.read().objects.get(path) {
            None => return Err(PibridgeError::UnknownPath(path.to_string())),
            Some(obj) if !obj.is_writable_state() => {
                return Err(PibridgeError::store(format!("{} is not writable", path)))
            }
            Some(_) => {}
        }

        self.commands_tx
            .send(StateCommand {
                path: path.to_string(),
                value,
            })
            .map_err(|_| PibridgeError::store("command channel closed"))
    }

    pub fn object(&self, path: &str) -> Option<ObjectDescriptor> {
        self.tree.read().objects.get(path).cloned()
    }

    fn write_state(&self, path: &str, value: StateValue, ack: bool, only_changed: bool) -> bool {
        let mut tree = self.tree.write();
        if only_changed {
            if let Some(current) = tree.states.get(path) {
                if current.val == value && current.ack == ack {
                    return false;
                }
            }
        }
        trace!(path, value = %value, ack, "State written");
        tree.states.insert(path.to_string(), State::new(value, ack));
        self.dirty.store(true, Ordering::SeqCst);
        true
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_below(id: &str, path: &str) -> bool {
    id.len() > path.len() && id.starts_with(path) && id.as_bytes()[path.len()] == b'.'
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set_state(&self, path: &str, value: StateValue, ack: bool) -> Result<()> {
        self.write_state(path, value, ack, false);
        Ok(())
    }

    async fn set_state_if_changed(&self, path: &str, value: StateValue, ack: bool) -> Result<bool> {
        Ok(self.write_state(path, value, ack, true))
    }

    async fn get_state(&self, path: &str) -> Result<Option<State>> {
        Ok(self.tree.read().states.get(path).cloned())
    }

    async fn ensure_object(&self, path: &str, descriptor: ObjectDescriptor) -> Result<()> {
        let mut tree = self.tree.write();
        if tree.objects.get(path) != Some(&descriptor) {
            debug!(path, role = %descriptor.common.role, "Object updated");
            tree.objects.insert(path.to_string(), descriptor);
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete_object(&self, path: &str, recursive: bool) -> Result<()> {
        let mut tree = self.tree.write();
        let before = tree.objects.len() + tree.states.len();

        tree.objects.remove(path);
        tree.states.remove(path);
        if recursive {
            tree.objects.retain(|id, _| !is_below(id, path));
            tree.states.retain(|id, _| !is_below(id, path));
        }

        if tree.objects.len() + tree.states.len() != before {
            debug!(path, recursive, "Object deleted");
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .tree
            .read()
            .objects
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<StateCommand>> {
        self.commands_rx.lock().take()
    }
}
