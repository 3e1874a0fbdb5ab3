//! Per-container state records under the runtime root.

use crate::error::{CoreError, PreconditionError, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of a container's state record.
pub const STATE_FILE: &str = "state.json";

/// Persisted metadata of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    /// Host pid hosting the container, i.e. its sandbox's VMM.
    pub pid: u32,
    /// Sandbox this container joined; absent for the sandbox owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    pub bundle: PathBuf,
    pub created: DateTime<Utc>,
}

impl State {
    /// Name of the sandbox the container lives in.
    pub fn owner(&self) -> &str {
        self.sandbox.as_deref().unwrap_or(&self.id)
    }
}

/// Check that `id` can name a directory directly under the root.
pub fn validate_id(id: &str) -> std::result::Result<(), PreconditionError> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(PreconditionError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Reads and writes `<root>/<id>/state.json`.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a container (and of the sandbox it owns, if any).
    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir(id).join(STATE_FILE))
    }

    pub fn load(&self, id: &str) -> Result<State> {
        read_json(&self.path(id)?)
    }

    /// True iff a state record exists for `id`.
    pub fn exists(&self, id: &str) -> bool {
        self.path(id).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn save(&self, state: &State) -> Result<()> {
        let path = self.path(&state.id)?;
        write_json_atomic(&path, state)?;
        tracing::debug!(container_id = %state.id, pid = state.pid, "State saved");
        Ok(())
    }

    /// Remove a container's directory and everything in it.
    pub fn remove(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        match std::fs::remove_dir_all(self.dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove only the state record of `id`, and its directory if that
    /// leaves it empty.
    pub fn discard(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.path(id)?) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let _ = std::fs::remove_dir(self.dir(id));
        Ok(())
    }

    /// Names of all entries directly under the root, sorted.
    ///
    /// A missing root has no entries.
    pub fn ids(&self) -> std::io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write `value` to `path` through a temp file in the same directory, so
/// readers see either the old or the new contents.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CoreError::Resource(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
