//! Run orchestration
//!
//! Drives one session from initiation to a terminal state:
//!
//! ```text
//! PENDING -> PLANNING -> EXECUTING_STEP_1 .. EXECUTING_STEP_N -> FINALIZING -> COMPLETED
//!    \__________\______________\___________________\____________-> FAILED
//! ```
//!
//! Each phase is persisted on entry. Every capability call is a separate task
//! invocation through the [`TaskRunner`], and every invocation that touches
//! the repository resolves its handle from the [`SessionRegistry`] afresh.
//! Steps run strictly in plan order.
//!
//! The registry entry is held by a [`SessionGuard`](crate::registry::SessionGuard)
//! for the whole run and released before the terminal status is written,
//! whichever way the run ends.

use crate::conductor::evaluator::filter_relevant;
use crate::conductor::generator::TextGenerator;
use crate::conductor::retry::{RetryPolicy, TaskRunner};
use crate::conductor::types::{
    ChangeRequest, CommitOutcome, PlanStep, RunOutcome, RunRequest, StepRecord,
};
use crate::config::{Config, DEFAULT_TASK_QUEUE};
use crate::message_bus::{Event, MessageBus};
use crate::registry::SessionRegistry;
use crate::secrets::scrub_secrets;
use crate::status::{Phase, StatusStore, StatusUpdate};
use crate::vcs::{normalize_path, CommitResult, Credentials, SessionFactory, Signature};
use sdk::errors::{ErrorExt, PipelineError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Longest first line of a commit message
const COMMIT_SUBJECT_LIMIT: usize = 72;

/// Per-deployment knobs for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub branch_prefix: String,
    /// Queue the runs are dispatched from; recorded on every run span
    pub task_queue: String,
    /// Policy for capability calls
    pub activity: RetryPolicy,
    /// Policy for status writes
    pub local: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            branch_prefix: String::new(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            activity: RetryPolicy::activity(),
            local: RetryPolicy::local(),
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            branch_prefix: config.repo.branch_prefix.clone(),
            task_queue: config.worker.task_queue.clone(),
            activity: RetryPolicy::from(&config.retry.activity),
            local: RetryPolicy::from(&config.retry.local),
        }
    }
}

/// Where a run-level error came from. Later variants win when choosing the
/// error a failed run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ErrorSource {
    Persistence,
    Planning,
    Finalization,
    Step,
}

/// Keeps the highest-priority error seen, and the first one within a priority.
#[derive(Debug, Default)]
struct ErrorSlot {
    current: Option<(ErrorSource, PipelineError)>,
}

impl ErrorSlot {
    fn record(&mut self, source: ErrorSource, err: PipelineError) {
        match &self.current {
            Some((existing, _)) if *existing >= source => {}
            _ => self.current = Some((source, err)),
        }
    }

    fn persistence_note(&self) -> Option<String> {
        match &self.current {
            Some((ErrorSource::Persistence, err)) => Some(scrub_secrets(&err.to_string())),
            _ => None,
        }
    }
}

struct RunState<'a> {
    session_id: &'a str,
    run_id: String,
    steps: Vec<StepRecord>,
    errors: ErrorSlot,
}

struct Finalized {
    branch: String,
    message: String,
}

pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn SessionFactory>,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn StatusStore>,
    bus: Arc<MessageBus>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn SessionFactory>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn StatusStore>,
        bus: Arc<MessageBus>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            factory,
            generator,
            store,
            bus,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one session to completion. Never returns early without a terminal outcome.
    pub async fn run(
        &self,
        session_id: &str,
        request: &RunRequest,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "run",
            task_queue = %self.settings.task_queue,
            session_id = %session_id,
            run_id = %run_id
        );

        async move {
            let runner = TaskRunner::new(cancel);
            let mut state = RunState {
                session_id,
                run_id,
                steps: Vec::new(),
                errors: ErrorSlot::default(),
            };

            let guard = self.registry.guard(session_id);

            self.enter(
                &runner,
                &mut state,
                StatusUpdate::phase(Phase::Pending).prompt(request.instruction.as_str()),
            )
            .await;

            let result = self.drive(&runner, request, &mut state).await;

            drop(guard);
            self.finish(state, result).await
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        runner: &TaskRunner,
        request: &RunRequest,
        state: &mut RunState<'_>,
    ) -> Result<Finalized, (ErrorSource, PipelineError)> {
        let session_id = state.session_id;
        let activity = &self.settings.activity;

        // INIT
        let handle = runner
            .invoke("open_session", activity, || {
                self.open_session(session_id, request)
            })
            .await
            .map_err(|e| (ErrorSource::Planning, e))?;
        self.registry.register(session_id, handle);

        // PLANNING
        self.enter(runner, state, StatusUpdate::phase(Phase::Planning))
            .await;
        let plan = runner
            .invoke("plan", activity, || {
                self.generator.plan(&request.instruction)
            })
            .await
            .map_err(|e| (ErrorSource::Planning, e))?;
        info!(steps = plan.len(), "plan accepted");
        self.persist(
            runner,
            state,
            StatusUpdate::phase(Phase::Planning).plan(plan.to_json()),
        )
        .await;

        // EXECUTING_STEP_i
        for step in plan.steps() {
            let phase = Phase::ExecutingStep(step.step);
            self.enter(runner, state, StatusUpdate::phase(phase)).await;

            let record = self
                .execute_step(runner, request, session_id, step)
                .await
                .map_err(|e| (ErrorSource::Step, e.in_step(step.step)))?;

            self.bus
                .publish(Event::StepRecorded {
                    session_id: session_id.to_string(),
                    step: step.step,
                    commit: record.commit.commit_id().map(str::to_string),
                })
                .await;
            state.steps.push(record);

            let outputs = serde_json::to_string(&state.steps).unwrap_or_default();
            self.persist(
                runner,
                state,
                StatusUpdate::phase(phase).step_outputs(outputs),
            )
            .await;
        }

        // FINALIZING
        self.enter(runner, state, StatusUpdate::phase(Phase::Finalizing))
            .await;
        self.finalize(runner, request, state)
            .await
            .map_err(|e| (ErrorSource::Finalization, e))
    }

    async fn execute_step(
        &self,
        runner: &TaskRunner,
        request: &RunRequest,
        session_id: &str,
        step: &PlanStep,
    ) -> Result<StepRecord, PipelineError> {
        let activity = &self.settings.activity;

        let files = runner
            .invoke("list_files", activity, || self.list_files(session_id))
            .await?;

        let suggested = runner
            .invoke("evaluate_files", activity, || {
                self.generator.relevant_files(step, &files)
            })
            .await?;
        let relevant = filter_relevant(&suggested, &files, step.step);

        let original = runner
            .invoke("read_files", activity, || {
                self.read_files(session_id, &relevant)
            })
            .await?;

        let generated = runner
            .invoke("generate_changes", activity, || {
                self.generator.generate_changes(ChangeRequest {
                    instruction: &request.instruction,
                    step,
                    files: &original,
                })
            })
            .await?;
        let changes = sanitize_changes(generated, step.step);

        let commit = if changes.is_empty() {
            info!(step = step.step, "step produced no changes");
            CommitOutcome::NoOp
        } else {
            runner
                .invoke("write_files", activity, || {
                    self.write_files(session_id, &changes)
                })
                .await?;

            let message = commit_message(step);
            let result = runner
                .invoke("commit", activity, || self.commit(session_id, &message))
                .await?;

            match result {
                CommitResult::Created(id) => {
                    info!(step = step.step, commit = %id, files = changes.len(), "step committed");
                    CommitOutcome::Committed { id }
                }
                CommitResult::Clean(head) => {
                    info!(step = step.step, "generated content matched the tree");
                    CommitOutcome::Unchanged { head }
                }
            }
        };

        Ok(StepRecord {
            step: step.step,
            instruction: step.instruction.clone(),
            relevant_files: relevant,
            original_content: original,
            new_content: changes,
            commit,
        })
    }

    async fn finalize(
        &self,
        runner: &TaskRunner,
        request: &RunRequest,
        state: &RunState<'_>,
    ) -> Result<Finalized, PipelineError> {
        let session_id = state.session_id;
        let activity = &self.settings.activity;
        let branch = branch_name(&self.settings.branch_prefix, &state.run_id);

        let head = runner
            .invoke("create_branch", activity, || {
                self.create_branch(session_id, &branch)
            })
            .await?;

        let commits = state
            .steps
            .iter()
            .filter(|s| s.commit.commit_id().is_some())
            .count();
        let summary = format!(
            "Applied {} step(s) with {} commit(s). Branch '{}' created at {}.",
            state.steps.len(),
            commits,
            branch,
            short_id(&head)
        );

        let message = match request.credentials.as_ref() {
            None => {
                info!(branch = %branch, "no git credentials, push skipped");
                format!("{} Push skipped: no git credentials configured.", summary)
            }
            Some(credentials) => {
                let pushed = runner
                    .invoke("push", activity, || {
                        self.push(session_id, &branch, credentials)
                    })
                    .await;
                match pushed {
                    Ok(()) => format!("{} Pushed to origin.", summary),
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(e) => {
                        warn!(branch = %branch, error = %e, "push failed, keeping local branch");
                        format!(
                            "{} Branch was not pushed: {}",
                            summary,
                            scrub_secrets(&e.to_string())
                        )
                    }
                }
            }
        };

        Ok(Finalized { branch, message })
    }

    async fn finish(
        &self,
        mut state: RunState<'_>,
        result: Result<Finalized, (ErrorSource, PipelineError)>,
    ) -> RunOutcome {
        // The run's own token may already be cancelled; the terminal write must still go out.
        let runner = TaskRunner::detached();
        let session_id = state.session_id.to_string();

        match result {
            Ok(finalized) => {
                let mut message = finalized.message;
                if let Some(note) = state.errors.persistence_note() {
                    message.push_str(&format!(
                        " Note: some status updates were not persisted ({}).",
                        note
                    ));
                }

                self.persist_terminal(
                    &runner,
                    &session_id,
                    StatusUpdate::phase(Phase::Completed).final_result(message.as_str()),
                )
                .await;
                self.bus
                    .publish(Event::RunCompleted {
                        session_id: session_id.clone(),
                        branch: finalized.branch.clone(),
                        message: message.clone(),
                    })
                    .await;
                info!(branch = %finalized.branch, "run completed");

                RunOutcome {
                    session_id,
                    run_id: state.run_id,
                    phase: Phase::Completed,
                    branch: Some(finalized.branch),
                    message,
                    error: None,
                    steps: state.steps,
                }
            }
            Err((source, err)) => {
                state.errors.record(source, err.clone());
                let err = state.errors.current.map(|(_, e)| e).unwrap_or(err);
                let detail = scrub_secrets(&format!("[{}] {}", err.kind(), err));

                self.persist_terminal(
                    &runner,
                    &session_id,
                    StatusUpdate::phase(Phase::Failed).error_detail(detail.as_str()),
                )
                .await;
                self.bus
                    .publish(Event::RunFailed {
                        session_id: session_id.clone(),
                        kind: err.kind().to_string(),
                        error: detail.clone(),
                    })
                    .await;
                error!(kind = err.kind(), error = %detail, "run failed");

                RunOutcome {
                    session_id,
                    run_id: state.run_id,
                    phase: Phase::Failed,
                    branch: None,
                    message: String::new(),
                    error: Some(err),
                    steps: state.steps,
                }
            }
        }
    }

    /// Persist a phase transition and announce it
    async fn enter(&self, runner: &TaskRunner, state: &mut RunState<'_>, update: StatusUpdate) {
        let phase = update.status;
        self.persist(runner, state, update).await;
        if let Some(phase) = phase {
            info!(phase = %phase, "phase entered");
            self.bus
                .publish(Event::PhaseEntered {
                    session_id: state.session_id.to_string(),
                    phase,
                })
                .await;
        }
    }

    /// Mid-run status write. Failures are soft: logged and remembered.
    async fn persist(&self, runner: &TaskRunner, state: &mut RunState<'_>, update: StatusUpdate) {
        let session_id = state.session_id;
        let store = &self.store;
        let result = runner
            .invoke("persist_status", &self.settings.local, || {
                store.upsert(session_id, update.clone())
            })
            .await;

        match result {
            Ok(_) | Err(PipelineError::Cancelled) => {}
            Err(e) => {
                warn!(error = %e, "status update not persisted");
                state.errors.record(ErrorSource::Persistence, e);
            }
        }
    }

    /// Terminal status write. A failure here is logged only.
    async fn persist_terminal(&self, runner: &TaskRunner, session_id: &str, update: StatusUpdate) {
        let store = &self.store;
        let result = runner
            .invoke("persist_terminal_status", &self.settings.local, || {
                store.upsert(session_id, update.clone())
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "terminal status not persisted; pollers will not see completion");
        }
    }

    // Task invocations. Each resolves the session handle through the registry.

    async fn open_session(
        &self,
        session_id: &str,
        request: &RunRequest,
    ) -> Result<Box<dyn crate::vcs::VcsSession>, PipelineError> {
        let handle = self
            .factory
            .open(session_id, &request.repo_url, request.credentials.as_ref())
            .await?;
        Ok(handle)
    }

    async fn list_files(&self, session_id: &str) -> Result<Vec<String>, PipelineError> {
        let handle = self.registry.lookup(session_id).await?;
        let session = handle.lock().await;
        Ok(session.list_files().await?)
    }

    /// Read each path; unreadable files are skipped with a warning.
    async fn read_files(
        &self,
        session_id: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, String>, PipelineError> {
        let handle = self.registry.lookup(session_id).await?;
        let session = handle.lock().await;

        let mut contents = BTreeMap::new();
        for path in paths {
            match session.read_file(path).await {
                Ok(content) => {
                    contents.insert(path.clone(), content);
                }
                Err(e) => warn!(path = %path, error = %e, "skipping unreadable file"),
            }
        }
        Ok(contents)
    }

    async fn write_files(
        &self,
        session_id: &str,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        let handle = self.registry.lookup(session_id).await?;
        let mut session = handle.lock().await;
        for (path, content) in changes {
            session.write_file(path, content).await?;
        }
        Ok(())
    }

    async fn commit(&self, session_id: &str, message: &str) -> Result<CommitResult, PipelineError> {
        let handle = self.registry.lookup(session_id).await?;
        let mut session = handle.lock().await;
        Ok(session.commit(message, &Signature::ai_agent()).await?)
    }

    async fn create_branch(&self, session_id: &str, branch: &str) -> Result<String, PipelineError> {
        let handle = self.registry.lookup(session_id).await?;
        let mut session = handle.lock().await;
        Ok(session.create_branch(branch).await?)
    }

    async fn push(
        &self,
        session_id: &str,
        branch: &str,
        credentials: &Credentials,
    ) -> Result<(), PipelineError> {
        let handle = self.registry.lookup(session_id).await?;
        let mut session = handle.lock().await;
        Ok(session.push(branch, credentials).await?)
    }
}

/// `<prefix>ai-<run_id>`
pub fn branch_name(prefix: &str, run_id: &str) -> String {
    format!("{}ai-{}", prefix, run_id)
}

/// `Step <i>: <instruction>`, first line capped at 72 characters.
/// A longer or multi-line instruction is repeated in full in the body.
pub fn commit_message(step: &PlanStep) -> String {
    let full = format!("Step {}: {}", step.step, step.instruction.trim());
    let first_line = full.lines().next().unwrap_or_default();

    let subject: String = if first_line.chars().count() > COMMIT_SUBJECT_LIMIT {
        let mut cut: String = first_line.chars().take(COMMIT_SUBJECT_LIMIT - 3).collect();
        cut.push_str("...");
        cut
    } else {
        first_line.to_string()
    };

    if subject == full {
        subject
    } else {
        format!("{}\n\n{}", subject, step.instruction.trim())
    }
}

/// Normalize generated paths; invalid ones are dropped with a warning.
fn sanitize_changes(generated: BTreeMap<String, String>, step: u32) -> BTreeMap<String, String> {
    let mut changes = BTreeMap::new();
    for (path, content) in generated {
        match normalize_path(&path) {
            Ok(normalized) => {
                changes.insert(normalized, content);
            }
            Err(_) => warn!(step, path = %path, "dropping change to invalid path"),
        }
    }
    changes
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
