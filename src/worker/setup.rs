//! Setup phase: materialize a task's files into a workspace and run its
//! setup commands, skipping them when the fileset is unchanged.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::error::{HiveError, Result};
use crate::protocol::Task;

/// Marker file recording the fileset hash of the last successful setup.
const HASH_MARKER: &str = ".fileset-hash";

/// A task workspace ready for the execute phase.
#[derive(Debug)]
pub struct PreparedTask {
    pub dir: PathBuf,
    /// True when setup commands were skipped because the fileset hash
    /// matched the previous run in this directory.
    pub setup_skipped: bool,
}

/// Materializes task workspaces under one root directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write the task's files under `root/<task dir>`, then run its setup
    /// commands unless the fileset hash matches the marker recorded by a
    /// previous successful setup in the same directory.
    pub async fn prepare(&self, task: &Task) -> Result<PreparedTask> {
        let dir = self.root.join(task_dir_name(task));
        tokio::fs::create_dir_all(&dir).await?;

        let hash = fileset_hash(&task.payload.files);
        let marker = dir.join(HASH_MARKER);
        let unchanged = matches!(
            tokio::fs::read_to_string(&marker).await,
            Ok(prev) if prev == hash
        );

        for (name, content) in &task.payload.files {
            let rel = sanitize_rel_path(name)?;
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }

        if unchanged {
            tracing::debug!(task_id = %task.task_id, dir = %dir.display(), "Fileset unchanged, skipping setup");
            return Ok(PreparedTask {
                dir,
                setup_skipped: true,
            });
        }

        for command in &task.payload.setup_commands {
            tracing::info!(task_id = %task.task_id, command, "Running setup command");
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&dir)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = if stderr.is_empty() {
                    format!("exit code {:?}", output.status.code())
                } else {
                    stderr.trim_end().to_string()
                };
                return Err(HiveError::Setup(format!(
                    "setup command '{}' failed: {}",
                    command, detail
                )));
            }
        }

        tokio::fs::write(&marker, &hash).await?;
        Ok(PreparedTask {
            dir,
            setup_skipped: false,
        })
    }
}

fn task_dir_name(task: &Task) -> String {
    if task.task_id.is_empty() {
        return uuid::Uuid::new_v4().to_string();
    }
    task.task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject absolute paths and parent-directory traversal in file names.
fn sanitize_rel_path(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let safe = !path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if name.is_empty() || !safe {
        return Err(HiveError::InvalidFilePath(name.to_string()));
    }
    Ok(path)
}

/// Order-independent SHA-256 over the task's file names and contents.
pub fn fileset_hash(files: &HashMap<String, String>) -> String {
    let mut entries: Vec<(&String, &String)> = files.iter().collect();
    entries.sort_by_key(|(name, _)| *name);

    let mut hasher = Sha256::new();
    for (name, content) in entries {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fileset_hash_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), "1".to_string());
        a.insert("y".to_string(), "2".to_string());

        let mut b = HashMap::new();
        b.insert("y".to_string(), "2".to_string());
        b.insert("x".to_string(), "1".to_string());

        assert_eq!(fileset_hash(&a), fileset_hash(&b));
    }

    #[test]
    fn fileset_hash_changes_with_content() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), "1".to_string());
        let mut b = HashMap::new();
        b.insert("x".to_string(), "2".to_string());

        assert_ne!(fileset_hash(&a), fileset_hash(&b));
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_rel_path("src/main.rs").is_ok());
        assert!(sanitize_rel_path("../evil").is_err());
        assert!(sanitize_rel_path("/etc/passwd").is_err());
        assert!(sanitize_rel_path("a/../../b").is_err());
        assert!(sanitize_rel_path("").is_err());
    }

    #[test]
    fn task_dir_name_sanitizes_id() {
        let task = Task::new("job/..%41", "build");
        assert_eq!(task_dir_name(&task), "job____41");
    }
}
