//! Version-control session capability
//!
//! A `VcsSession` wraps one cloned repository's mutable state (working tree,
//! index, branches) for the lifetime of one pipeline run. Two implementations
//! ship with the engine:
//!
//! - [`GitRepository`]: a real clone on disk driven through the `git` CLI.
//!   Cloned into `<data_dir>/sessions/<session_id>` so that a worker that lost
//!   its in-memory handle can reattach to it.
//! - [`MemoryRepository`]: a pure in-memory tree with commit history, used for
//!   tests and dry runs.
//!
//! Sessions are not safe for concurrent mutation; the registry hands them out
//! behind an async mutex.

use crate::secrets::SecretString;
use async_trait::async_trait;
use sdk::errors::PipelineError;
use std::path::{Component, Path};

pub mod git;
pub mod memory;

pub use git::{GitFactory, GitRepository};
pub use memory::{MemoryCommit, MemoryFactory, MemoryRepository};

/// Errors from version-control operations
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("remote rejected {operation}: {detail}")]
    Rejected { operation: String, detail: String },

    #[error("no persisted session for {0}")]
    NoSession(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VcsError> for PipelineError {
    fn from(err: VcsError) -> Self {
        match err {
            VcsError::BranchExists(name) => PipelineError::BranchExists(name),
            VcsError::NoSession(id) => PipelineError::SessionNotFound(id),
            VcsError::NotFound(_) | VcsError::InvalidPath(_) | VcsError::Rejected { .. } => {
                PipelineError::VersionControlRejected(err.to_string())
            }
            VcsError::Command { .. } | VcsError::Io(_) => {
                PipelineError::VersionControl(err.to_string())
            }
        }
    }
}

/// Username/secret pair used for clone and push over HTTPS
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: SecretString) -> Self {
        Self {
            username: username.into(),
            secret,
        }
    }
}

/// Commit identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    /// Identity used for every pipeline commit
    pub fn ai_agent() -> Self {
        Self {
            name: "AI Agent".to_string(),
            email: "ai@example.com".to_string(),
        }
    }
}

/// Outcome of a commit request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// A new commit was created
    Created(String),
    /// Nothing was staged; carries the unchanged head
    Clean(String),
}

impl CommitResult {
    pub fn id(&self) -> &str {
        match self {
            CommitResult::Created(id) | CommitResult::Clean(id) => id,
        }
    }
}

/// One cloned repository owned by one session
#[async_trait]
pub trait VcsSession: Send + Sync {
    /// Session this handle belongs to
    fn session_id(&self) -> &str;

    /// All files in the working tree (tracked and untracked, excluding `.git`), sorted
    async fn list_files(&self) -> Result<Vec<String>, VcsError>;

    /// Read one file from the working tree
    async fn read_file(&self, path: &str) -> Result<String, VcsError>;

    /// Write one file, creating parent directories, and stage it
    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), VcsError>;

    /// Commit everything staged. A clean index is not an error.
    async fn commit(&mut self, message: &str, author: &Signature)
        -> Result<CommitResult, VcsError>;

    /// Current head commit id
    async fn head(&self) -> Result<String, VcsError>;

    /// Create a branch at head without checking it out. Returns the head id.
    async fn create_branch(&mut self, name: &str) -> Result<String, VcsError>;

    /// Push a local branch to the origin remote
    async fn push(&mut self, branch: &str, credentials: &Credentials) -> Result<(), VcsError>;
}

/// Creates and recovers version-control sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Clone `repo_url` for a fresh session
    async fn open(
        &self,
        session_id: &str,
        repo_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn VcsSession>, VcsError>;

    /// Recover a session whose in-memory handle is gone. `Ok(None)` when nothing is persisted.
    async fn reattach(&self, session_id: &str) -> Result<Option<Box<dyn VcsSession>>, VcsError>;
}

/// Normalize a repository-relative path.
///
/// Rejects empty, absolute, parent-escaping, and `.git` paths.
pub fn normalize_path(raw: &str) -> Result<String, VcsError> {
    let trimmed = raw.trim();
    let invalid = || VcsError::InvalidPath(raw.to_string());

    if trimmed.is_empty() || trimmed.contains('\0') || trimmed.contains('\\') {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(invalid)?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid())
            }
        }
    }

    if parts.is_empty() || parts[0] == ".git" {
        return Err(invalid());
    }

    Ok(parts.join("/"))
}
