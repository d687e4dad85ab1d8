//! Repository Cache Manager (§4.A).
//!
//! Clones and fetches project repositories into a project-scoped cache
//! directory and exposes a working tree per execution. Generalizes the
//! teacher's `GitTracker` (a snapshot-commit-and-diff helper built around a
//! single already-checked-out tree) into a clone/fetch/checkout-task-branch
//! model. `git2` is still the workhorse; since it's a synchronous library
//! and this service runs on the async executor, every git2 call is pushed
//! onto `spawn_blocking`.

use crate::errors::RepoError;
use devteam_common::TaskId;
use git2::{FetchOptions, Repository};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

/// Clone/fetch are retried up to this many attempts total (§4.A).
const MAX_RETRYABLE_ATTEMPTS: u32 = 3;

/// Owns the on-disk repo cache for every project (§3 Ownership).
pub struct RepoCacheManager {
    cache_root: PathBuf,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// The default branch name observed right after clone, before any task
    /// branch is ever checked out. Read by fetch/merge/push so they always
    /// target the project's actual default branch rather than whatever
    /// branch `HEAD` happens to be on — which, once `checkout_task_branch`
    /// has run, is the task branch, not the default.
    default_branches: StdMutex<HashMap<String, String>>,
}

impl RepoCacheManager {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            locks: StdMutex::new(HashMap::new()),
            default_branches: StdMutex::new(HashMap::new()),
        }
    }

    pub fn local_path(&self, project_id: &str) -> PathBuf {
        self.cache_root.join(sanitize_project_id(project_id))
    }

    fn lock_for(&self, project_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("repo cache lock map poisoned");
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Clones on first use; fetches and fast-forwards on subsequent calls.
    /// Concurrent `ensure`s for the same project are serialized by a
    /// per-project lock; other projects proceed in parallel.
    #[instrument(skip(self, repo_url))]
    pub async fn ensure(&self, project_id: &str, repo_url: &str) -> Result<PathBuf, RepoError> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        let path = self.local_path(project_id);

        if path.join(".git").exists() {
            self.fetch_inner(project_id, &path).await?;
        } else {
            self.clone_inner(project_id, repo_url, &path).await?;
        }
        Ok(path)
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, project_id: &str) -> Result<(), RepoError> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        let path = self.local_path(project_id);
        self.fetch_inner(project_id, &path).await
    }

    async fn clone_inner(
        &self,
        project_id: &str,
        repo_url: &str,
        path: &Path,
    ) -> Result<(), RepoError> {
        retry(MAX_RETRYABLE_ATTEMPTS, || {
            let project_id = project_id.to_string();
            let repo_url = repo_url.to_string();
            let path = path.to_path_buf();
            async move {
                let result = tokio::task::spawn_blocking(move || {
                    Repository::clone(&repo_url, &path).map(|_| ())
                })
                .await;
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(RepoError::Clone {
                        project_id,
                        source: source.into(),
                    }),
                    Err(join_err) => Err(RepoError::Clone {
                        project_id,
                        source: anyhow::anyhow!(join_err),
                    }),
                }
            }
        })
        .await?;

        // HEAD is on the remote's default branch immediately after clone —
        // the one and only point where reading it is reliable.
        let path_owned = path.to_path_buf();
        if let Ok(Ok(branch)) = tokio::task::spawn_blocking(move || default_branch(&path_owned)).await {
            self.default_branches
                .lock()
                .expect("default branch cache poisoned")
                .insert(project_id.to_string(), branch);
        }
        Ok(())
    }

    async fn fetch_inner(&self, project_id: &str, path: &Path) -> Result<(), RepoError> {
        let default = self.known_or_detect_default(project_id, path).await?;
        retry(MAX_RETRYABLE_ATTEMPTS, || {
            let project_id = project_id.to_string();
            let path = path.to_path_buf();
            let default = default.clone();
            async move {
                let result = tokio::task::spawn_blocking(move || fetch_and_fast_forward(&path, &default)).await;
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(RepoError::Fetch { project_id, source }),
                    Err(join_err) => Err(RepoError::Fetch {
                        project_id,
                        source: anyhow::anyhow!(join_err),
                    }),
                }
            }
        })
        .await
    }

    /// Returns the cached default branch name, detecting and caching it
    /// from `HEAD` if this is the first call for `project_id` (only safe
    /// before any task branch has ever been checked out).
    async fn known_or_detect_default(&self, project_id: &str, path: &Path) -> Result<String, RepoError> {
        if let Some(branch) = self
            .default_branches
            .lock()
            .expect("default branch cache poisoned")
            .get(project_id)
            .cloned()
        {
            return Ok(branch);
        }

        let path_owned = path.to_path_buf();
        let project_owned = project_id.to_string();
        let result = tokio::task::spawn_blocking(move || default_branch(&path_owned)).await;
        match result {
            Ok(Ok(branch)) => {
                self.default_branches
                    .lock()
                    .expect("default branch cache poisoned")
                    .insert(project_owned, branch.clone());
                Ok(branch)
            }
            Ok(Err(source)) => Err(RepoError::Fetch { project_id: project_owned, source }),
            Err(join_err) => Err(RepoError::Fetch {
                project_id: project_owned,
                source: anyhow::anyhow!(join_err),
            }),
        }
    }

    /// Checks out (creating if necessary) the task branch for `task_id` off
    /// the current default branch tip. Not retried: a checkout failure
    /// usually means a dirty working tree, which retrying won't fix (§4.A).
    #[instrument(skip(self, title))]
    pub async fn checkout_task_branch(
        &self,
        project_id: &str,
        task_id: &TaskId,
        title: &str,
    ) -> Result<String, RepoError> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        let path = self.local_path(project_id);
        let branch = branch_name(task_id, title);

        let path_owned = path.clone();
        let branch_owned = branch.clone();
        let result = tokio::task::spawn_blocking(move || checkout_branch(&path_owned, &branch_owned)).await;
        match result {
            Ok(Ok(())) => Ok(branch),
            Ok(Err(source)) => Err(RepoError::Checkout {
                project_id: project_id.to_string(),
                branch,
                source,
            }),
            Err(join_err) => Err(RepoError::Checkout {
                project_id: project_id.to_string(),
                branch,
                source: anyhow::anyhow!(join_err),
            }),
        }
    }

    pub async fn get_default_branch(&self, project_id: &str) -> Result<String, RepoError> {
        let path = self.local_path(project_id);
        self.known_or_detect_default(project_id, &path).await
    }

    /// Merges `branch` into the default branch, fast-forwarding when
    /// possible and otherwise creating a merge commit. Not retried: a real
    /// conflict needs a human or a remediation task, not another attempt
    /// (§4.F MERGE).
    #[instrument(skip(self, branch))]
    pub async fn merge_task_branch(&self, project_id: &str, branch: &str) -> Result<String, RepoError> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        let path = self.local_path(project_id);
        let default = self.known_or_detect_default(project_id, &path).await?;
        let path_owned = path.clone();
        let branch_owned = branch.to_string();
        let result = tokio::task::spawn_blocking(move || merge_branch(&path_owned, &default, &branch_owned)).await;
        match result {
            Ok(Ok(hash)) => Ok(hash),
            Ok(Err(source)) => Err(RepoError::Merge {
                project_id: project_id.to_string(),
                branch: branch.to_string(),
                source,
            }),
            Err(join_err) => Err(RepoError::Merge {
                project_id: project_id.to_string(),
                branch: branch.to_string(),
                source: anyhow::anyhow!(join_err),
            }),
        }
    }

    /// Pushes the default branch to `origin` after a successful merge.
    /// Callers retry this themselves (bounded, §4.F PUSH) since a
    /// transient network failure shouldn't redo the merge.
    #[instrument(skip(self))]
    pub async fn push_default_branch(&self, project_id: &str) -> Result<String, RepoError> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        let path = self.local_path(project_id);
        let default = self.known_or_detect_default(project_id, &path).await?;
        let project_owned = project_id.to_string();
        let default_owned = default.clone();
        let result = tokio::task::spawn_blocking(move || push_default_branch_blocking(&path, &default_owned)).await;
        match result {
            Ok(Ok(())) => Ok(default),
            Ok(Err(source)) => Err(RepoError::Push {
                project_id: project_owned,
                branch: default,
                source,
            }),
            Err(join_err) => Err(RepoError::Push {
                project_id: project_owned,
                branch: default,
                source: anyhow::anyhow!(join_err),
            }),
        }
    }
}

async fn retry<F, Fut, T>(max_attempts: u32, mut f: F) -> Result<T, RepoError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepoError>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && e.retryable() => {
                warn!(attempt, error = %e, "repo operation failed, retrying");
                tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt - 1))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn fetch_and_fast_forward(path: &Path, default_branch: &str) -> anyhow::Result<()> {
    let repo = Repository::open(path)?;
    let mut remote = repo.find_remote("origin")?;
    let mut fetch_opts = FetchOptions::new();
    remote.fetch(&[] as &[&str], Some(&mut fetch_opts), None)?;

    let default_refname = format!("refs/heads/{default_branch}");
    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let analysis = repo.merge_analysis(&[&fetch_commit])?;

    if analysis.0.is_fast_forward() {
        let mut reference = repo.find_reference(&default_refname)?;
        reference.set_target(fetch_commit.id(), "fast-forward")?;
        repo.set_head(&default_refname)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
    }
    Ok(())
}

fn default_branch_name(repo: &Repository) -> anyhow::Result<String> {
    let head = repo.head()?;
    Ok(head.shorthand().unwrap_or("main").to_string())
}

fn default_branch(path: &Path) -> anyhow::Result<String> {
    let repo = Repository::open(path)?;
    default_branch_name(&repo)
}

/// Fast-forwards when possible; otherwise merges with a commit authored by
/// the runner itself, since the container's `git` has no configured
/// identity to fall back on. A real conflict aborts the in-progress merge
/// and bails rather than leaving the index half-resolved.
fn merge_branch(path: &Path, default_branch: &str, branch: &str) -> anyhow::Result<String> {
    let repo = Repository::open(path)?;
    let default_refname = format!("refs/heads/{default_branch}");
    repo.set_head(&default_refname)?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;

    let branch_ref = repo.find_branch(branch, git2::BranchType::Local)?.into_reference();
    let branch_commit = branch_ref.peel_to_commit()?;
    let annotated = repo.reference_to_annotated_commit(&branch_ref)?;
    let analysis = repo.merge_analysis(&[&annotated])?;

    if analysis.0.is_up_to_date() {
        return Ok(repo.head()?.peel_to_commit()?.id().to_string());
    }

    if analysis.0.is_fast_forward() {
        let mut reference = repo.find_reference(&default_refname)?;
        reference.set_target(branch_commit.id(), "fast-forward merge")?;
        repo.set_head(&default_refname)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
        return Ok(branch_commit.id().to_string());
    }

    repo.merge(&[&annotated], None, None)?;
    let mut index = repo.index()?;
    if index.has_conflicts() {
        repo.cleanup_state()?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
        anyhow::bail!("merge conflict between {default_refname} and {branch}");
    }

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = git2::Signature::now("devteam-runner", "devteam-runner@local")?;
    let head_commit = repo.head()?.peel_to_commit()?;
    let commit_id = repo.commit(
        Some("HEAD"),
        &sig,
        &sig,
        &format!("Merge branch '{branch}'"),
        &tree,
        &[&head_commit, &branch_commit],
    )?;
    repo.cleanup_state()?;
    Ok(commit_id.to_string())
}

fn push_default_branch_blocking(path: &Path, default_branch: &str) -> anyhow::Result<()> {
    let repo = Repository::open(path)?;
    let mut remote = repo.find_remote("origin")?;
    let refspec = format!("refs/heads/{default_branch}:refs/heads/{default_branch}");
    remote.push(&[&refspec], None)?;
    Ok(())
}

fn checkout_branch(path: &Path, branch: &str) -> anyhow::Result<()> {
    let repo = Repository::open(path)?;
    let head_commit = repo.head()?.peel_to_commit()?;

    match repo.find_branch(branch, git2::BranchType::Local) {
        Ok(existing) => {
            let refname = existing
                .into_reference()
                .name()
                .ok_or_else(|| anyhow::anyhow!("branch reference has no name"))?
                .to_string();
            repo.set_head(&refname)?;
        }
        Err(_) => {
            repo.branch(branch, &head_commit, false)?;
            repo.set_head(&format!("refs/heads/{branch}"))?;
        }
    }
    repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
    Ok(())
}

/// `task/<dotted-id>-<slugified-title>`, truncated to 64 characters (§6.4).
fn branch_name(task_id: &TaskId, title: &str) -> String {
    let full = format!("task/{task_id}-{}", slugify(title));
    if full.chars().count() > 64 {
        full.chars().take(64).collect()
    } else {
        full
    }
}

fn slugify(title: &str) -> String {
    let mut out = String::new();
    let mut last_was_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn sanitize_project_id(project_id: &str) -> String {
    project_id.replace('/', "-")
}
