//! Project move transaction
//!
//! Moving a project relocates its directory, rewrites absolute paths inside
//! the per-project config, and updates the record. Each step pushes an undo
//! action; any failure unwinds the executed steps in reverse. A rollback
//! failure marks the project `needs-recovery` instead of guessing further.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::DaemonError;
use crate::events::DaemonEvent;

use super::core::ProjectRegistry;

/// Options for `move_project`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MoveOptions {
    /// Leave a symlink at the old path pointing to the new one
    pub symlink: bool,
    /// Create missing parent directories of the destination
    pub merge_parents: bool,
    /// Replace an existing empty directory at the destination
    pub force: bool,
}

enum UndoStep {
    /// Move the directory back
    RenameBack { from: PathBuf, to: PathBuf },
    /// Restore the original per-project config content
    RestoreConfig { path: PathBuf, content: String },
    /// Remove a symlink created at the old path
    RemoveSymlink { path: PathBuf },
}

impl ProjectRegistry {
    /// Move a project's directory and update its record atomically.
    ///
    /// Refused while the project has running tasks; `running_tasks` is the
    /// caller's view of the queue at the time of the call.
    pub async fn move_project(
        &self,
        id: &str,
        new_path: PathBuf,
        options: MoveOptions,
        running_tasks: usize,
    ) -> Result<(), DaemonError> {
        if self.is_read_only() {
            return Err(DaemonError::ReadOnly("registry".into()));
        }
        if running_tasks > 0 {
            return Err(DaemonError::ProjectBusy {
                project_id: id.to_string(),
                running: running_tasks,
            });
        }
        if !new_path.is_absolute() {
            return Err(DaemonError::InvalidArgs(format!(
                "destination must be absolute: {}",
                new_path.display()
            )));
        }

        let record = self
            .get(id)
            .await
            .ok_or_else(|| DaemonError::ProjectNotFound(id.to_string()))?;
        let old_path = record.path.clone();

        if new_path == old_path {
            return Err(DaemonError::InvalidArgs("destination equals current path".into()));
        }
        if new_path.exists() {
            let empty = std::fs::read_dir(&new_path).map(|mut d| d.next().is_none()).unwrap_or(false);
            if !(options.force && empty) {
                return Err(DaemonError::InvalidArgs(format!(
                    "destination already exists: {}",
                    new_path.display()
                )));
            }
            std::fs::remove_dir(&new_path)?;
        }

        let mut undo: Vec<UndoStep> = Vec::new();

        match self.run_move_steps(id, &old_path, &new_path, &options, &mut undo).await {
            Ok(()) => {
                info!(project_id = %id, from = %old_path.display(), to = %new_path.display(), "Project moved");
                self.flush().await?;
                self.event_bus().emit(DaemonEvent::ProjectUpdated {
                    project_id: id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(project_id = %id, error = %e, "Move failed, rolling back");
                if let Err(rollback_err) = rollback(undo) {
                    warn!(project_id = %id, error = %rollback_err, "Rollback failed");
                    self.mark_needs_recovery(id).await;
                    return Err(DaemonError::MoveFailed {
                        project_id: id.to_string(),
                        detail: format!("{e}; rollback: {rollback_err}"),
                    });
                }
                Err(e)
            }
        }
    }

    async fn run_move_steps(
        &self,
        id: &str,
        old_path: &Path,
        new_path: &Path,
        options: &MoveOptions,
        undo: &mut Vec<UndoStep>,
    ) -> Result<(), DaemonError> {
        // Step 1: destination parents
        if let Some(parent) = new_path.parent()
            && !parent.exists()
        {
            if !options.merge_parents {
                return Err(DaemonError::InvalidArgs(format!(
                    "parent directory missing: {} (use mergeParents)",
                    parent.display()
                )));
            }
            std::fs::create_dir_all(parent)?;
        }

        // Step 2: relocate the directory
        move_dir(old_path, new_path)?;
        undo.push(UndoStep::RenameBack {
            from: new_path.to_path_buf(),
            to: old_path.to_path_buf(),
        });

        // Step 3: rewrite absolute paths inside the per-project config
        let config_path = new_path.join(".poppo").join("config.json");
        if config_path.exists() {
            let original = std::fs::read_to_string(&config_path)?;
            let rewritten = original.replace(
                old_path.to_string_lossy().as_ref(),
                new_path.to_string_lossy().as_ref(),
            );
            if rewritten != original {
                std::fs::write(&config_path, &rewritten)?;
                undo.push(UndoStep::RestoreConfig {
                    path: config_path,
                    content: original,
                });
            }
        }

        // Step 4: symlink at the old location
        if options.symlink {
            #[cfg(unix)]
            std::os::unix::fs::symlink(new_path, old_path)?;
            undo.push(UndoStep::RemoveSymlink {
                path: old_path.to_path_buf(),
            });
        }

        // Step 5: update the record
        let doc = self.doc_handle();
        let mut doc = doc.write().await;
        let record = doc
            .projects
            .get_mut(id)
            .ok_or_else(|| DaemonError::ProjectNotFound(id.to_string()))?;
        record.path = new_path.to_path_buf();
        record.updated_at = Utc::now();
        doc.metadata.updated_at = Some(Utc::now());
        if let Err(detail) = doc.validate() {
            return Err(DaemonError::InvalidArgs(detail));
        }
        Ok(())
    }
}

/// EXDEV - rename attempted across filesystem boundaries
const EXDEV: i32 = 18;

/// Rename, falling back to copy+delete across filesystem boundaries
fn move_dir(from: &Path, to: &Path) -> Result<(), DaemonError> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            copy_dir_all(from, to)?;
            std::fs::remove_dir_all(from)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn copy_dir_all(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn rollback(undo: Vec<UndoStep>) -> std::io::Result<()> {
    for step in undo.into_iter().rev() {
        match step {
            UndoStep::RenameBack { from, to } => std::fs::rename(&from, &to)?,
            UndoStep::RestoreConfig { path, content } => std::fs::write(&path, content)?,
            UndoStep::RemoveSymlink { path } => std::fs::remove_file(&path)?,
        }
    }
    Ok(())
}
