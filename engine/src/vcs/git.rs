//! Git adapter for version-control sessions.
//!
//! Every operation shells out to `git` in the session's clone directory.
//! Credentials never touch the clone's config: they are spliced into the
//! remote URL only for the duration of `clone` and `push`, and any text
//! derived from those commands is scrubbed before it is logged or returned.

use super::{normalize_path, CommitResult, Credentials, SessionFactory, Signature, VcsError, VcsSession};
use crate::secrets::scrub_secrets;
use async_trait::async_trait;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Marker written into `.git/` naming the handle that owns the clone.
const OWNER_FILE: &str = "anvil-owner";

/// A clone on disk driven through the git CLI.
///
/// The clone directory is removed when the owning handle is dropped. A handle
/// superseded by a newer clone for the same session leaves the directory alone.
#[derive(Debug)]
pub struct GitRepository {
    session_id: String,
    workdir: PathBuf,
    token: String,
}

impl GitRepository {
    /// Clone `repo_url` into `workdir`, replacing anything already there.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn clone_into(
        session_id: &str,
        repo_url: &str,
        workdir: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<Self, VcsError> {
        if workdir.exists() {
            warn!(path = %workdir.display(), "removing stale clone directory");
            tokio::fs::remove_dir_all(workdir).await?;
        }
        if let Some(parent) = workdir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let remote = authenticated_url(repo_url, credentials);
        let parent = workdir.parent().unwrap_or_else(|| Path::new("."));
        let target = workdir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| VcsError::InvalidPath(workdir.display().to_string()))?;
        info!(repo = %scrub_secrets(repo_url), "cloning repository");

        run_checked(
            parent,
            &["clone", "--depth", "1", "--no-single-branch", &remote, &target],
        )
        .await?;

        // Keep the stored origin free of credentials
        if remote != repo_url {
            run_checked(workdir, &["remote", "set-url", "origin", repo_url]).await?;
        }

        let token = uuid::Uuid::new_v4().to_string();
        tokio::fs::write(workdir.join(".git").join(OWNER_FILE), &token).await?;

        Ok(Self {
            session_id: session_id.to_string(),
            workdir: workdir.to_path_buf(),
            token,
        })
    }

    /// Adopt an existing clone. Returns `None` when `workdir` holds no clone.
    pub async fn reopen(session_id: &str, workdir: &Path) -> Result<Option<Self>, VcsError> {
        let owner = workdir.join(".git").join(OWNER_FILE);
        let token = match tokio::fs::read_to_string(&owner).await {
            Ok(token) => token.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(Self {
            session_id: session_id.to_string(),
            workdir: workdir.to_path_buf(),
            token,
        }))
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf), VcsError> {
        let normalized = normalize_path(path)?;
        let full = self.workdir.join(&normalized);
        Ok((normalized, full))
    }

    async fn has_staged_changes(&self) -> Result<bool, VcsError> {
        let out = run(&self.workdir, &["diff", "--cached", "--quiet"]).await?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(command_error(&["diff", "--cached"], &out)),
        }
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, VcsError> {
        let reference = format!("refs/heads/{branch}");
        let out = run(&self.workdir, &["show-ref", "--verify", "--quiet", &reference]).await?;
        Ok(out.status.success())
    }

    async fn origin_url(&self) -> Result<String, VcsError> {
        let out = run_checked(&self.workdir, &["remote", "get-url", "origin"]).await?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl Drop for GitRepository {
    fn drop(&mut self) {
        let owner = self.workdir.join(".git").join(OWNER_FILE);
        match std::fs::read_to_string(&owner) {
            Ok(token) if token.trim() == self.token => {
                if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
                    warn!(session_id = %self.session_id, error = %e, "failed to remove clone");
                } else {
                    debug!(session_id = %self.session_id, "clone removed");
                }
            }
            _ => debug!(session_id = %self.session_id, "clone owned elsewhere, leaving in place"),
        }
    }
}

#[async_trait]
impl VcsSession for GitRepository {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn list_files(&self) -> Result<Vec<String>, VcsError> {
        let out = run_checked(
            &self.workdir,
            &["ls-files", "--cached", "--others", "--exclude-standard", "-z"],
        )
        .await?;
        let mut files: Vec<String> = String::from_utf8_lossy(&out.stdout)
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    async fn read_file(&self, path: &str) -> Result<String, VcsError> {
        let (normalized, full) = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VcsError::NotFound(normalized)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), VcsError> {
        let (normalized, full) = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        run_checked(&self.workdir, &["add", "--", &normalized]).await?;
        debug!(path = %normalized, bytes = content.len(), "file written and staged");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %self.session_id))]
    async fn commit(
        &mut self,
        message: &str,
        author: &Signature,
    ) -> Result<CommitResult, VcsError> {
        if !self.has_staged_changes().await? {
            debug!("no staged changes, skipping commit");
            return Ok(CommitResult::Clean(self.head().await?));
        }

        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        run_checked(
            &self.workdir,
            &["-c", &name, "-c", &email, "commit", "--no-verify", "-m", message],
        )
        .await?;

        let id = self.head().await?;
        info!(commit = %id, "commit created");
        Ok(CommitResult::Created(id))
    }

    async fn head(&self) -> Result<String, VcsError> {
        let out = run_checked(&self.workdir, &["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn create_branch(&mut self, name: &str) -> Result<String, VcsError> {
        if self.branch_exists(name).await? {
            return Err(VcsError::BranchExists(name.to_string()));
        }
        run_checked(&self.workdir, &["branch", name]).await?;
        let head = self.head().await?;
        info!(branch = %name, head = %head, "branch created");
        Ok(head)
    }

    #[instrument(skip_all, fields(session_id = %self.session_id, branch = %branch))]
    async fn push(&mut self, branch: &str, credentials: &Credentials) -> Result<(), VcsError> {
        let origin = self.origin_url().await?;
        let remote = authenticated_url(&origin, Some(credentials));
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");

        let out = run(&self.workdir, &["push", &remote, &refspec]).await?;
        if !out.status.success() {
            let detail = scrub_secrets(String::from_utf8_lossy(&out.stderr).trim());
            warn!(detail = %detail, "push failed");
            return Err(VcsError::Rejected {
                operation: "push".to_string(),
                detail,
            });
        }

        info!("branch pushed");
        Ok(())
    }
}

/// Clones sessions under a common root directory, one directory per session.
#[derive(Debug, Clone)]
pub struct GitFactory {
    sessions_dir: PathBuf,
}

impl GitFactory {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    fn workdir_for(&self, session_id: &str) -> Result<PathBuf, VcsError> {
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(VcsError::InvalidPath(session_id.to_string()));
        }
        Ok(self.sessions_dir.join(session_id))
    }
}

#[async_trait]
impl SessionFactory for GitFactory {
    async fn open(
        &self,
        session_id: &str,
        repo_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn VcsSession>, VcsError> {
        let workdir = self.workdir_for(session_id)?;
        let repo = GitRepository::clone_into(session_id, repo_url, &workdir, credentials).await?;
        Ok(Box::new(repo))
    }

    async fn reattach(&self, session_id: &str) -> Result<Option<Box<dyn VcsSession>>, VcsError> {
        let workdir = self.workdir_for(session_id)?;
        let repo = GitRepository::reopen(session_id, &workdir).await?;
        if repo.is_some() {
            info!(session_id = %session_id, "reattached persisted clone");
        }
        Ok(repo.map(|r| Box::new(r) as Box<dyn VcsSession>))
    }
}

/// Splice credentials into an HTTP(S) URL. Other schemes are returned unchanged.
fn authenticated_url(repo_url: &str, credentials: Option<&Credentials>) -> String {
    let Some(creds) = credentials else {
        return repo_url.to_string();
    };
    let Ok(mut url) = Url::parse(repo_url) else {
        return repo_url.to_string();
    };
    if !matches!(url.scheme(), "http" | "https") {
        return repo_url.to_string();
    }
    if url.set_username(&creds.username).is_err()
        || url.set_password(Some(creds.secret.unsecure())).is_err()
    {
        return repo_url.to_string();
    }
    url.to_string()
}

fn command_error(args: &[&str], output: &Output) -> VcsError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    VcsError::Command {
        command: scrub_secrets(&args.join(" ")),
        stderr: scrub_secrets(stderr.trim()),
    }
}

async fn run_checked(workdir: &Path, args: &[&str]) -> Result<Output, VcsError> {
    let output = run(workdir, args).await?;
    if !output.status.success() {
        return Err(command_error(args, &output));
    }
    Ok(output)
}

async fn run(workdir: &Path, args: &[&str]) -> Result<Output, VcsError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(output)
}
