//! The workspace boundary: how the coordinator observes and mutates the
//! user's source tree.
//!
//! The coordinator depends only on the [`WorkspaceAdapter`] trait; the
//! default implementation ([`git::GitWorkspace`]) is one acceptable
//! collaborator, and tests substitute an in-memory fake.

pub mod git;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

/// Snapshot of a working tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    /// Current branch, when HEAD is on one.
    pub branch: Option<String>,
    /// Whether the tree differs from HEAD.
    pub is_dirty: bool,
    /// Tracked files with modifications.
    pub modified_files: Vec<String>,
    /// Untracked files.
    pub untracked_files: Vec<String>,
}

/// One linked worktree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    /// Worktree root.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
}

/// Options for pull-request authoring.
#[derive(Debug, Clone, Default)]
pub struct PullRequestOptions {
    /// Title; derived from the branch when absent.
    pub title: Option<String>,
    /// Body text.
    pub description: Option<String>,
    /// Base branch.
    pub base_branch: Option<String>,
}

/// Keeps a file-system watcher alive; dropping it stops the watch.
pub struct WatchGuard {
    _watcher: Box<dyn std::any::Any + Send>,
}

impl WatchGuard {
    /// Wrap any watcher object whose drop stops the watch.
    #[must_use]
    pub fn new(watcher: Box<dyn std::any::Any + Send>) -> Self {
        Self { _watcher: watcher }
    }
}

/// The contract the coordinator drives. Implementations are blocking;
/// callers on the runtime wrap calls in `spawn_blocking` where latency
/// matters.
pub trait WorkspaceAdapter: Send + Sync {
    /// Report the state of a working tree.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` when `workdir` is not a repository.
    fn status(&self, workdir: &Path) -> Result<WorkspaceStatus>;

    /// Record a recoverable snapshot of uncommitted work, returning an
    /// identifier when one was created.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on snapshot failure.
    fn create_backup_snapshot(&self, workdir: &Path) -> Result<Option<String>>;

    /// Create a branch at HEAD.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn create_branch(&self, workdir: &Path, name: &str) -> Result<()>;

    /// Check out an existing branch.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn switch_branch(&self, workdir: &Path, name: &str) -> Result<()>;

    /// Stash the working tree.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn stash(&self, workdir: &Path, message: Option<&str>) -> Result<Option<String>>;

    /// Create a linked worktree on a new branch off `base_branch`.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn create_worktree(&self, workdir: &Path, base_branch: Option<&str>) -> Result<WorktreeInfo>;

    /// Remove a linked worktree and optionally its branch.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn delete_worktree(
        &self,
        workdir: &Path,
        worktree_path: &Path,
        branch: &str,
        force: bool,
    ) -> Result<()>;

    /// Enumerate linked worktrees.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn list_worktrees(&self, workdir: &Path) -> Result<Vec<WorktreeInfo>>;

    /// Commit the given files (all modified files when empty), returning
    /// the commit id when something was committed.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn commit(&self, workdir: &Path, message: &str, files: &[String]) -> Result<Option<String>>;

    /// Unified diff of one file against HEAD.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn diff(&self, file: &str, workdir: &Path) -> Result<String>;

    /// Author a pull request for the current branch, returning its URL.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` on failure.
    fn generate_pull_request(
        &self,
        workdir: &Path,
        options: &PullRequestOptions,
    ) -> Result<String>;

    /// Watch the tree for changes; paths of changed files are sent to
    /// `tx` until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` when the watcher cannot be installed.
    fn watch_workspace(&self, workdir: &Path, tx: mpsc::Sender<PathBuf>) -> Result<WatchGuard>;
}

pub use git::GitWorkspace;
