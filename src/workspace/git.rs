//! Git-backed workspace adapter.
//!
//! Repositories are discovered per call, so one adapter instance serves
//! every workdir. Pull-request authoring shells out to `gh`; everything
//! else goes through libgit2.

use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{
    build::CheckoutBuilder, DiffOptions, Repository, StatusOptions, WorktreeAddOptions,
    WorktreePruneOptions,
};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    PullRequestOptions, WatchGuard, WorkspaceAdapter, WorkspaceStatus, WorktreeInfo,
};
use crate::{AppError, Result};

/// Directory (relative to the repository root) holding bridge worktrees.
const WORKTREE_DIR: &str = ".prompt-dock-worktrees";

/// The default adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitWorkspace;

impl GitWorkspace {
    /// Construct the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn discover(workdir: &Path) -> Result<Repository> {
    Repository::discover(workdir)
        .map_err(|err| AppError::Workspace(format!("{}: {err}", workdir.display())))
}

fn collect_status(repo: &Repository) -> Result<WorkspaceStatus> {
    let branch = repo
        .head()
        .ok()
        .and_then(|head| head.shorthand().map(ToOwned::to_owned));

    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .include_ignored(false)
        .recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut modified = Vec::new();
    let mut untracked = Vec::new();
    for entry in statuses.iter() {
        let Some(path) = entry.path() else { continue };
        if entry.status().is_wt_new() {
            untracked.push(path.to_owned());
        } else {
            modified.push(path.to_owned());
        }
    }

    Ok(WorkspaceStatus {
        branch,
        is_dirty: !modified.is_empty() || !untracked.is_empty(),
        modified_files: modified,
        untracked_files: untracked,
    })
}

fn stash_with_message(workdir: &Path, message: &str) -> Result<Option<String>> {
    let mut repo = discover(workdir)?;
    let signature = repo
        .signature()
        .or_else(|_| git2::Signature::now("prompt-dock", "prompt-dock@localhost"))?;
    match repo.stash_save(&signature, message, Some(git2::StashFlags::INCLUDE_UNTRACKED)) {
        Ok(oid) => Ok(Some(oid.to_string())),
        // Nothing to stash is not a failure.
        Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl WorkspaceAdapter for GitWorkspace {
    fn status(&self, workdir: &Path) -> Result<WorkspaceStatus> {
        let repo = discover(workdir)?;
        collect_status(&repo)
    }

    fn create_backup_snapshot(&self, workdir: &Path) -> Result<Option<String>> {
        stash_with_message(workdir, "prompt-dock backup snapshot")
    }

    fn create_branch(&self, workdir: &Path, name: &str) -> Result<()> {
        let repo = discover(workdir)?;
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(name, &head, false)?;
        Ok(())
    }

    fn switch_branch(&self, workdir: &Path, name: &str) -> Result<()> {
        let repo = discover(workdir)?;
        let refname = format!("refs/heads/{name}");
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().safe()))?;
        Ok(())
    }

    fn stash(&self, workdir: &Path, message: Option<&str>) -> Result<Option<String>> {
        stash_with_message(workdir, message.unwrap_or("prompt-dock stash"))
    }

    fn create_worktree(&self, workdir: &Path, base_branch: Option<&str>) -> Result<WorktreeInfo> {
        let repo = discover(workdir)?;
        let repo_root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.path().to_path_buf());

        let base_commit = match base_branch {
            Some(name) => repo
                .find_branch(name, git2::BranchType::Local)?
                .get()
                .peel_to_commit()?,
            None => repo.head()?.peel_to_commit()?,
        };

        let short = Uuid::new_v4().simple().to_string();
        let branch_name = format!("prompt-dock/{}", &short[..8]);
        let branch = repo.branch(&branch_name, &base_commit, false)?;

        let worktree_root = repo_root.join(WORKTREE_DIR);
        std::fs::create_dir_all(&worktree_root)?;
        let worktree_path = worktree_root.join(&short[..8]);

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch.get()));
        repo.worktree(&short[..8], &worktree_path, Some(&opts))?;

        Ok(WorktreeInfo {
            path: worktree_path,
            branch: branch_name,
        })
    }

    fn delete_worktree(
        &self,
        workdir: &Path,
        worktree_path: &Path,
        branch: &str,
        force: bool,
    ) -> Result<()> {
        let repo = discover(workdir)?;
        for name in repo.worktrees()?.iter().flatten() {
            let wt = repo.find_worktree(name)?;
            if wt.path() == worktree_path {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(force).locked(force).working_tree(true);
                wt.prune(Some(&mut opts))?;
                break;
            }
        }
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        if let Ok(mut b) = repo.find_branch(branch, git2::BranchType::Local) {
            if let Err(err) = b.delete() {
                warn!(branch, %err, "failed to delete worktree branch");
            }
        }
        Ok(())
    }

    fn list_worktrees(&self, workdir: &Path) -> Result<Vec<WorktreeInfo>> {
        let repo = discover(workdir)?;
        let mut out = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            let wt = repo.find_worktree(name)?;
            out.push(WorktreeInfo {
                path: wt.path().to_path_buf(),
                branch: name.to_owned(),
            });
        }
        Ok(out)
    }

    fn commit(&self, workdir: &Path, message: &str, files: &[String]) -> Result<Option<String>> {
        let repo = discover(workdir)?;
        let mut index = repo.index()?;
        if files.is_empty() {
            index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        } else {
            for file in files {
                index.add_path(Path::new(file))?;
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let head = repo.head()?.peel_to_commit()?;
        if tree_id == head.tree_id() {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let signature = repo
            .signature()
            .or_else(|_| git2::Signature::now("prompt-dock", "prompt-dock@localhost"))?;
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&head])?;
        Ok(Some(oid.to_string()))
    }

    fn diff(&self, file: &str, workdir: &Path) -> Result<String> {
        let repo = discover(workdir)?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let mut opts = DiffOptions::new();
        opts.pathspec(file).include_untracked(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;

        let mut text = String::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            let prefix = match line.origin() {
                '+' | '-' | ' ' => Some(line.origin()),
                _ => None,
            };
            if let Some(p) = prefix {
                text.push(p);
            }
            text.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(text)
    }

    fn generate_pull_request(
        &self,
        workdir: &Path,
        options: &PullRequestOptions,
    ) -> Result<String> {
        let mut cmd = Command::new("gh");
        cmd.current_dir(workdir).args(["pr", "create"]);
        match &options.title {
            Some(title) => {
                cmd.args(["--title", title]);
                cmd.args(["--body", options.description.as_deref().unwrap_or("")]);
            }
            None => {
                cmd.arg("--fill");
            }
        }
        if let Some(base) = &options.base_branch {
            cmd.args(["--base", base]);
        }

        let output = cmd
            .output()
            .map_err(|err| AppError::Workspace(format!("failed to run gh: {err}")))?;
        if !output.status.success() {
            return Err(AppError::Workspace(format!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn watch_workspace(&self, workdir: &Path, tx: mpsc::Sender<PathBuf>) -> Result<WatchGuard> {
        let root = workdir.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            if !matches!(
                event.kind,
                notify::EventKind::Create(_)
                    | notify::EventKind::Modify(_)
                    | notify::EventKind::Remove(_)
            ) {
                return;
            }
            for path in event.paths {
                // Changes under .git are plumbing noise, not workspace edits.
                if path.components().any(|c| c.as_os_str() == ".git") {
                    continue;
                }
                if tx.try_send(path.clone()).is_err() {
                    debug!(path = %path.display(), "workspace watch channel full, dropping");
                }
            }
        })
        .map_err(|err| AppError::Workspace(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|err| AppError::Workspace(format!("failed to watch workspace: {err}")))?;

        Ok(WatchGuard::new(Box::new(watcher)))
    }
}
