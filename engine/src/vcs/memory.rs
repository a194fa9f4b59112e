//! In-memory version-control session.
//!
//! Models a working tree, an index, linear commit history and branches
//! without touching disk. Handles are cheap clones over shared state so a
//! test can keep one and inspect history after the pipeline released its own.

use super::{normalize_path, CommitResult, Credentials, SessionFactory, Signature, VcsError, VcsSession};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

type Tree = BTreeMap<String, String>;

/// One commit in a [`MemoryRepository`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCommit {
    pub id: String,
    pub parent: Option<String>,
    pub message: String,
    pub author: Signature,
    pub tree: Tree,
}

#[derive(Debug, Default)]
struct State {
    worktree: Tree,
    index: Tree,
    commits: Vec<MemoryCommit>,
    branches: BTreeMap<String, String>,
    pushed: Vec<String>,
    reject_push: bool,
}

impl State {
    fn head(&self) -> Option<&MemoryCommit> {
        self.commits.last()
    }

    fn head_tree(&self) -> Tree {
        self.head().map(|c| c.tree.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRepository {
    session_id: String,
    state: Arc<Mutex<State>>,
}

impl MemoryRepository {
    /// Repository with a single initial commit holding `files` on branch `main`.
    pub fn seeded<I, P, C>(session_id: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let tree: Tree = files
            .into_iter()
            .map(|(p, c)| (p.into(), c.into()))
            .collect();
        let initial = MemoryCommit {
            id: new_commit_id(),
            parent: None,
            message: "Initial commit".to_string(),
            author: Signature {
                name: "seed".to_string(),
                email: "seed@localhost".to_string(),
            },
            tree: tree.clone(),
        };

        let mut branches = BTreeMap::new();
        branches.insert("main".to_string(), initial.id.clone());

        let state = State {
            worktree: tree.clone(),
            index: tree,
            commits: vec![initial],
            branches,
            ..Default::default()
        };

        Self {
            session_id: session_id.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Make every push fail as if the remote rejected it.
    pub fn reject_pushes(&self) {
        self.lock().reject_push = true;
    }

    /// Commit history, oldest first
    pub fn commits(&self) -> Vec<MemoryCommit> {
        self.lock().commits.clone()
    }

    /// Branch name to commit id
    pub fn branches(&self) -> BTreeMap<String, String> {
        self.lock().branches.clone()
    }

    /// Branches successfully pushed, in order
    pub fn pushed(&self) -> Vec<String> {
        self.lock().pushed.clone()
    }

    /// Current working-tree content of `path`
    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().worktree.get(path).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the maps intact; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl VcsSession for MemoryRepository {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn list_files(&self) -> Result<Vec<String>, VcsError> {
        Ok(self.lock().worktree.keys().cloned().collect())
    }

    async fn read_file(&self, path: &str) -> Result<String, VcsError> {
        let path = normalize_path(path)?;
        self.lock()
            .worktree
            .get(&path)
            .cloned()
            .ok_or(VcsError::NotFound(path))
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), VcsError> {
        let path = normalize_path(path)?;
        let mut state = self.lock();
        state.worktree.insert(path.clone(), content.to_string());
        state.index.insert(path, content.to_string());
        Ok(())
    }

    async fn commit(
        &mut self,
        message: &str,
        author: &Signature,
    ) -> Result<CommitResult, VcsError> {
        let mut state = self.lock();
        let parent = state.head().map(|c| c.id.clone());

        if state.index == state.head_tree() {
            return parent
                .map(CommitResult::Clean)
                .ok_or_else(|| VcsError::NotFound("HEAD".to_string()));
        }

        let commit = MemoryCommit {
            id: new_commit_id(),
            parent,
            message: message.to_string(),
            author: author.clone(),
            tree: state.index.clone(),
        };
        let id = commit.id.clone();
        state.commits.push(commit);
        if let Some(tip) = state.branches.get_mut("main") {
            *tip = id.clone();
        }
        Ok(CommitResult::Created(id))
    }

    async fn head(&self) -> Result<String, VcsError> {
        self.lock()
            .head()
            .map(|c| c.id.clone())
            .ok_or_else(|| VcsError::NotFound("HEAD".to_string()))
    }

    async fn create_branch(&mut self, name: &str) -> Result<String, VcsError> {
        let mut state = self.lock();
        if state.branches.contains_key(name) {
            return Err(VcsError::BranchExists(name.to_string()));
        }
        let head = state
            .head()
            .map(|c| c.id.clone())
            .ok_or_else(|| VcsError::NotFound("HEAD".to_string()))?;
        state.branches.insert(name.to_string(), head.clone());
        Ok(head)
    }

    async fn push(&mut self, branch: &str, _credentials: &Credentials) -> Result<(), VcsError> {
        let mut state = self.lock();
        if !state.branches.contains_key(branch) {
            return Err(VcsError::NotFound(format!("refs/heads/{branch}")));
        }
        if state.reject_push {
            return Err(VcsError::Rejected {
                operation: "push".to_string(),
                detail: "remote rejected the update".to_string(),
            });
        }
        state.pushed.push(branch.to_string());
        Ok(())
    }
}

/// Hands out [`MemoryRepository`] sessions seeded from a fixed file set.
///
/// Every repository it opened stays reachable through [`MemoryFactory::repository`].
/// In-memory state is not durable, so `reattach` never finds anything.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    seed: Tree,
    reject_push: bool,
    opened: Mutex<HashMap<String, MemoryRepository>>,
}

impl MemoryFactory {
    pub fn new<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            seed: files
                .into_iter()
                .map(|(p, c)| (p.into(), c.into()))
                .collect(),
            ..Default::default()
        }
    }

    /// Repositories opened from now on reject pushes.
    pub fn rejecting_pushes(mut self) -> Self {
        self.reject_push = true;
        self
    }

    /// Shared handle on the repository opened for `session_id`
    pub fn repository(&self, session_id: &str) -> Option<MemoryRepository> {
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    async fn open(
        &self,
        session_id: &str,
        _repo_url: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn VcsSession>, VcsError> {
        let repo = MemoryRepository::seeded(session_id, self.seed.clone());
        if self.reject_push {
            repo.reject_pushes();
        }
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.to_string(), repo.clone());
        Ok(Box::new(repo))
    }

    async fn reattach(&self, _session_id: &str) -> Result<Option<Box<dyn VcsSession>>, VcsError> {
        Ok(None)
    }
}

fn new_commit_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
