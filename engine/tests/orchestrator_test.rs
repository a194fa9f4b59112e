//! End-to-end runs of the orchestrator over in-memory repositories
//!
//! Text generation is scripted per step so each scenario controls exactly
//! what the planner, relevance filter and generator return.

use anvil_engine::conductor::{
    CommitOutcome, LlmTextGenerator, Orchestrator, OrchestratorSettings, Plan, PlanStep,
    RetryPolicy, RunRequest, TextGenerator, Worker,
};
use anvil_engine::conductor::types::ChangeRequest;
use anvil_engine::llm::{CompletionRequest, LLMError, LLMProvider};
use anvil_engine::message_bus::{Event, EventType, MessageBus};
use anvil_engine::registry::SessionRegistry;
use anvil_engine::secrets::SecretString;
use anvil_engine::status::{MemoryStatusStore, Phase, StatusRecord, StatusStore, StatusUpdate};
use anvil_engine::vcs::memory::MemoryFactory;
use anvil_engine::vcs::{
    CommitResult, Credentials, SessionFactory, Signature, VcsError, VcsSession,
};
use async_trait::async_trait;
use sdk::errors::{ErrorExt, PipelineError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const MIT: &str = "MIT License\n\nPermission is hereby granted, free of charge...\n";
const REPO: &str = "https://example.com/acme/demo.git";

type Changes = BTreeMap<String, String>;

/// Text generator driven by a script
#[derive(Default)]
struct ScriptedGenerator {
    plan: Option<Result<Plan, PipelineError>>,
    relevant: Vec<String>,
    changes: HashMap<u32, Result<Changes, PipelineError>>,
    block_plan: bool,
    release_on_relevant: bool,

    registry: Option<Arc<SessionRegistry>>,
    plan_started: Notify,
    registered_during_plan: Mutex<Vec<usize>>,
    listings: Mutex<Vec<Vec<String>>>,
    generate_calls: Mutex<Vec<u32>>,
}

impl ScriptedGenerator {
    fn planning(steps: &[&str]) -> Self {
        Self {
            plan: Some(Ok(Plan::from_instructions(steps.iter().copied()))),
            ..Default::default()
        }
    }

    fn failing_plan(err: PipelineError) -> Self {
        Self {
            plan: Some(Err(err)),
            ..Default::default()
        }
    }

    fn step(mut self, step: u32, result: Result<Changes, PipelineError>) -> Self {
        self.changes.insert(step, result);
        self
    }

    fn relevant(mut self, files: &[&str]) -> Self {
        self.relevant = files.iter().map(|f| f.to_string()).collect();
        self
    }

    fn calls_for(&self, step: u32) -> usize {
        self.generate_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == step)
            .count()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn plan(&self, _instruction: &str) -> Result<Plan, PipelineError> {
        if let Some(registry) = &self.registry {
            self.registered_during_plan
                .lock()
                .unwrap()
                .push(registry.len());
        }
        self.plan_started.notify_one();
        if self.block_plan {
            std::future::pending::<()>().await;
        }
        self.plan.clone().unwrap_or(Err(PipelineError::EmptyPlan))
    }

    async fn relevant_files(
        &self,
        _step: &PlanStep,
        files: &[String],
    ) -> Result<Vec<String>, PipelineError> {
        self.listings.lock().unwrap().push(files.to_vec());
        if self.release_on_relevant {
            if let Some(registry) = &self.registry {
                registry.release("s1");
            }
        }
        Ok(self.relevant.clone())
    }

    async fn generate_changes(&self, request: ChangeRequest<'_>) -> Result<Changes, PipelineError> {
        self.generate_calls.lock().unwrap().push(request.step.step);
        self.changes
            .get(&request.step.step)
            .cloned()
            .unwrap_or_else(|| Ok(Changes::new()))
    }
}

/// Store that fails every non-terminal write
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStatusStore,
}

#[async_trait]
impl StatusStore for FlakyStore {
    async fn upsert(
        &self,
        session_id: &str,
        update: StatusUpdate,
    ) -> Result<StatusRecord, PipelineError> {
        match update.status {
            Some(phase) if phase.is_terminal() => self.inner.upsert(session_id, update).await,
            _ => Err(PipelineError::Persistence("database is locked".into())),
        }
    }

    async fn get(&self, session_id: &str) -> Result<Option<StatusRecord>, PipelineError> {
        self.inner.get(session_id).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StatusRecord>, PipelineError> {
        self.inner.recent(limit).await
    }
}

/// Failures to inject into sessions opened by [`FaultyFactory`]
#[derive(Default)]
struct Faults {
    /// Every branch name is already taken
    branch_taken: bool,
    /// Reading this path fails
    unreadable: Option<String>,
}

/// Wraps a [`MemoryFactory`], injecting faults and counting calls
struct FaultyFactory {
    inner: Arc<MemoryFactory>,
    faults: Arc<Faults>,
    branch_attempts: Arc<AtomicUsize>,
    reattaches: AtomicUsize,
}

#[async_trait]
impl SessionFactory for FaultyFactory {
    async fn open(
        &self,
        session_id: &str,
        repo_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn VcsSession>, VcsError> {
        let inner = self.inner.open(session_id, repo_url, credentials).await?;
        Ok(Box::new(FaultySession {
            inner,
            faults: self.faults.clone(),
            branch_attempts: self.branch_attempts.clone(),
        }))
    }

    async fn reattach(&self, session_id: &str) -> Result<Option<Box<dyn VcsSession>>, VcsError> {
        self.reattaches.fetch_add(1, Ordering::SeqCst);
        self.inner.reattach(session_id).await
    }
}

struct FaultySession {
    inner: Box<dyn VcsSession>,
    faults: Arc<Faults>,
    branch_attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl VcsSession for FaultySession {
    fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    async fn list_files(&self) -> Result<Vec<String>, VcsError> {
        self.inner.list_files().await
    }

    async fn read_file(&self, path: &str) -> Result<String, VcsError> {
        if self.faults.unreadable.as_deref() == Some(path) {
            return Err(VcsError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            )));
        }
        self.inner.read_file(path).await
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), VcsError> {
        self.inner.write_file(path, content).await
    }

    async fn commit(&mut self, message: &str, author: &Signature) -> Result<CommitResult, VcsError> {
        self.inner.commit(message, author).await
    }

    async fn head(&self) -> Result<String, VcsError> {
        self.inner.head().await
    }

    async fn create_branch(&mut self, name: &str) -> Result<String, VcsError> {
        self.branch_attempts.fetch_add(1, Ordering::SeqCst);
        if self.faults.branch_taken {
            return Err(VcsError::BranchExists(name.to_string()));
        }
        self.inner.create_branch(name).await
    }

    async fn push(&mut self, branch: &str, credentials: &Credentials) -> Result<(), VcsError> {
        self.inner.push(branch, credentials).await
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(1),
        backoff_coefficient: 2.0,
        maximum_interval: Duration::from_millis(5),
        maximum_attempts: 3,
        timeout: Duration::from_secs(5),
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        branch_prefix: String::new(),
        task_queue: "test-queue".to_string(),
        activity: fast_policy(),
        local: fast_policy(),
    }
}

struct Harness {
    factory: Arc<MemoryFactory>,
    faulty: Arc<FaultyFactory>,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn StatusStore>,
    bus: Arc<MessageBus>,
    generator: Arc<ScriptedGenerator>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    fn new(generator: ScriptedGenerator) -> Self {
        Self::build(generator, MemoryFactory::new([("README.md", "# demo\n")]), None)
    }

    fn build(
        generator: ScriptedGenerator,
        factory: MemoryFactory,
        store: Option<Arc<dyn StatusStore>>,
    ) -> Self {
        Self::assemble(generator, factory, store, Faults::default())
    }

    fn with_faults(generator: ScriptedGenerator, factory: MemoryFactory, faults: Faults) -> Self {
        Self::assemble(generator, factory, None, faults)
    }

    fn assemble(
        mut generator: ScriptedGenerator,
        factory: MemoryFactory,
        store: Option<Arc<dyn StatusStore>>,
        faults: Faults,
    ) -> Self {
        let factory = Arc::new(factory);
        let faulty = Arc::new(FaultyFactory {
            inner: factory.clone(),
            faults: Arc::new(faults),
            branch_attempts: Arc::new(AtomicUsize::new(0)),
            reattaches: AtomicUsize::new(0),
        });
        let dyn_factory: Arc<dyn SessionFactory> = faulty.clone();
        let registry = Arc::new(SessionRegistry::with_factory(dyn_factory.clone()));
        generator.registry = Some(registry.clone());
        let generator = Arc::new(generator);
        let store =
            store.unwrap_or_else(|| Arc::new(MemoryStatusStore::new()) as Arc<dyn StatusStore>);
        let bus = Arc::new(MessageBus::new());

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            dyn_factory,
            generator.clone(),
            store.clone(),
            bus.clone(),
            settings(),
        ));

        Self {
            factory,
            faulty,
            registry,
            store,
            bus,
            generator,
            orchestrator,
        }
    }

    async fn record(&self, session_id: &str) -> StatusRecord {
        self.store.get(session_id).await.unwrap().unwrap()
    }
}

fn license_changes() -> Result<Changes, PipelineError> {
    Ok(Changes::from([("LICENSE".to_string(), MIT.to_string())]))
}

fn credentials() -> Credentials {
    Credentials::new("bot", SecretString::new("ghp_secret"))
}

#[tokio::test]
async fn test_license_scenario_completes_without_push() {
    let harness = Harness::new(
        ScriptedGenerator::planning(&["create LICENSE file with MIT text"]).step(1, license_changes()),
    );

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("add a LICENSE file", REPO), CancellationToken::new())
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    let branch = outcome.branch.clone().unwrap();
    assert_eq!(branch, format!("ai-{}", outcome.run_id));
    assert!(outcome.message.contains("Push skipped"));

    assert_eq!(outcome.steps.len(), 1);
    assert!(outcome.steps[0].relevant_files.is_empty());
    assert!(matches!(outcome.steps[0].commit, CommitOutcome::Committed { .. }));

    let repo = harness.factory.repository("s1").unwrap();
    let commits = repo.commits();
    assert_eq!(commits.len(), 2);
    let last = commits.last().unwrap();
    assert_eq!(last.message, "Step 1: create LICENSE file with MIT text");
    assert_eq!(last.author.name, "AI Agent");
    assert_eq!(last.author.email, "ai@example.com");
    assert_eq!(repo.branches().get(&branch), Some(&last.id));
    assert_eq!(repo.file("LICENSE").as_deref(), Some(MIT));
    assert!(repo.pushed().is_empty());

    let record = harness.record("s1").await;
    assert_eq!(record.status, Phase::Completed);
    assert_eq!(record.prompt, "add a LICENSE file");
    assert!(record.plan.contains("create LICENSE file"));
    assert!(record.step_outputs.contains("LICENSE"));
    assert!(record.final_result.contains("Push skipped"));
    assert!(record.error_detail.is_empty());

    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_invalid_plan_fails_before_any_step() {
    let harness = Harness::new(ScriptedGenerator::failing_plan(
        PipelineError::InvalidPlanFormat("expected a JSON array of steps".into()),
    ));

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("do something", REPO), CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, Phase::Failed);
    assert_eq!(outcome.error.as_ref().unwrap().kind(), "InvalidPlanFormat");
    assert!(outcome.steps.is_empty());
    assert!(outcome.branch.is_none());
    assert!(harness.generator.generate_calls.lock().unwrap().is_empty());

    let record = harness.record("s1").await;
    assert_eq!(record.status, Phase::Failed);
    assert!(record.error_detail.starts_with("[InvalidPlanFormat]"));
    assert!(record.final_result.is_empty());

    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_empty_plan_never_completes() {
    let harness = Harness::new(ScriptedGenerator::failing_plan(PipelineError::EmptyPlan));

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("nothing", REPO), CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, Phase::Failed);
    assert_eq!(outcome.error, Some(PipelineError::EmptyPlan));
    assert_eq!(harness.record("s1").await.status, Phase::Failed);
}

#[tokio::test]
async fn test_step_failure_keeps_earlier_commits_and_skips_branch() {
    let harness = Harness::new(
        ScriptedGenerator::planning(&["write a.txt", "write b.txt", "write c.txt"])
            .step(1, Ok(Changes::from([("a.txt".into(), "a\n".into())])))
            .step(2, Err(PipelineError::TextGeneration("rate limit exceeded".into())))
            .step(3, Ok(Changes::from([("c.txt".into(), "c\n".into())]))),
    );

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("three files", REPO), CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, Phase::Failed);
    let err = outcome.error.clone().unwrap();
    assert!(matches!(err, PipelineError::Step { step: 2, .. }));
    assert_eq!(err.kind(), "TextGeneration");

    // Retried up to the attempt limit, and step 3 never ran
    assert_eq!(harness.generator.calls_for(2), 3);
    assert_eq!(harness.generator.calls_for(3), 0);
    assert_eq!(outcome.steps.len(), 1);

    let repo = harness.factory.repository("s1").unwrap();
    assert_eq!(repo.commits().len(), 2);
    assert_eq!(repo.file("a.txt").as_deref(), Some("a\n"));
    assert_eq!(repo.branches().len(), 1);

    let record = harness.record("s1").await;
    assert_eq!(record.status, Phase::Failed);
    assert!(record.error_detail.contains("step 2 failed"));
    assert!(record.step_outputs.contains("a.txt"));

    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_step_without_changes_is_a_noop() {
    let harness = Harness::new(
        ScriptedGenerator::planning(&["check the README", "create LICENSE"])
            .step(1, Ok(Changes::new()))
            .step(2, license_changes()),
    );

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("license", REPO), CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.steps[0].commit, CommitOutcome::NoOp);
    assert!(outcome.steps[1].commit.commit_id().is_some());
    assert_eq!(harness.factory.repository("s1").unwrap().commits().len(), 2);
}

#[tokio::test]
async fn test_later_steps_see_earlier_commits() {
    let harness = Harness::new(
        ScriptedGenerator::planning(&["create LICENSE", "mention the license in README.md"])
            .relevant(&["README.md", "LICENSE"])
            .step(1, license_changes())
            .step(
                2,
                Ok(Changes::from([(
                    "README.md".into(),
                    "# demo\n\nMIT licensed.\n".into(),
                )])),
            ),
    );

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("license", REPO), CancellationToken::new())
        .await;
    assert!(outcome.is_success());

    let listings = harness.generator.listings.lock().unwrap().clone();
    assert_eq!(listings.len(), 2);
    assert!(!listings[0].contains(&"LICENSE".to_string()));
    assert!(listings[1].contains(&"LICENSE".to_string()));

    // Step 1 dropped the unknown LICENSE suggestion; step 2 read it
    assert_eq!(outcome.steps[0].relevant_files, vec!["README.md"]);
    assert_eq!(outcome.steps[1].original_content["LICENSE"], MIT);
}

#[tokio::test]
async fn test_invalid_generated_paths_are_dropped() {
    let harness = Harness::new(ScriptedGenerator::planning(&["escape"]).step(
        1,
        Ok(Changes::from([
            ("../outside".into(), "x".into()),
            (".git/config".into(), "x".into()),
        ])),
    ));

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("escape", REPO), CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.steps[0].commit, CommitOutcome::NoOp);
    assert_eq!(harness.factory.repository("s1").unwrap().commits().len(), 1);
}

#[tokio::test]
async fn test_session_registered_only_while_running() {
    let harness = Harness::new(ScriptedGenerator::planning(&["create LICENSE"]).step(1, license_changes()));
    assert!(harness.registry.is_empty());

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("license", REPO), CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(*harness.generator.registered_during_plan.lock().unwrap(), vec![1]);
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_push_with_credentials() {
    let harness = Harness::new(ScriptedGenerator::planning(&["create LICENSE"]).step(1, license_changes()));

    let request = RunRequest::new("license", REPO).with_credentials(Some(credentials()));
    let outcome = harness
        .orchestrator
        .run("s1", &request, CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert!(outcome.message.contains("Pushed to origin"));
    let repo = harness.factory.repository("s1").unwrap();
    assert_eq!(repo.pushed(), vec![outcome.branch.unwrap()]);
}

#[tokio::test]
async fn test_rejected_push_still_completes() {
    let harness = Harness::build(
        ScriptedGenerator::planning(&["create LICENSE"]).step(1, license_changes()),
        MemoryFactory::new([("README.md", "# demo\n")]).rejecting_pushes(),
        None,
    );

    let request = RunRequest::new("license", REPO).with_credentials(Some(credentials()));
    let outcome = harness
        .orchestrator
        .run("s1", &request, CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert!(outcome.message.contains("was not pushed"));
    assert!(!outcome.message.contains("ghp_secret"));

    let repo = harness.factory.repository("s1").unwrap();
    assert!(repo.branches().contains_key(&outcome.branch.unwrap()));
    assert!(repo.pushed().is_empty());
    assert_eq!(harness.record("s1").await.status, Phase::Completed);
}

#[tokio::test]
async fn test_cancellation_fails_run_and_releases_session() {
    let generator = ScriptedGenerator {
        block_plan: true,
        ..ScriptedGenerator::planning(&["never runs"])
    };
    let harness = Harness::new(generator);
    let cancel = CancellationToken::new();

    let orchestrator = harness.orchestrator.clone();
    let token = cancel.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .run("s1", &RunRequest::new("hang", REPO), token)
            .await
    });

    harness.generator.plan_started.notified().await;
    assert_eq!(harness.registry.len(), 1);
    cancel.cancel();

    let outcome = run.await.unwrap();
    assert_eq!(outcome.phase, Phase::Failed);
    assert_eq!(outcome.error, Some(PipelineError::Cancelled));
    assert!(harness.registry.is_empty());

    let record = harness.record("s1").await;
    assert_eq!(record.status, Phase::Failed);
    assert!(record.error_detail.starts_with("[Cancelled]"));
}

#[tokio::test]
async fn test_persistence_failures_are_soft() {
    let store: Arc<dyn StatusStore> = Arc::new(FlakyStore::default());
    let harness = Harness::build(
        ScriptedGenerator::planning(&["create LICENSE"]).step(1, license_changes()),
        MemoryFactory::new([("README.md", "# demo\n")]),
        Some(store),
    );

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("license", REPO), CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert!(outcome.message.contains("not persisted"));

    let record = harness.record("s1").await;
    assert_eq!(record.status, Phase::Completed);
    assert!(record.final_result.contains("not persisted"));
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let harness = Harness::new(ScriptedGenerator::planning(&["create LICENSE"]).step(1, license_changes()));
    let mut events = harness.bus.subscribe(EventType::All).await;

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("license", REPO), CancellationToken::new())
        .await;
    assert!(outcome.is_success());

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    let phases: Vec<Phase> = received
        .iter()
        .filter_map(|e| match e {
            Event::PhaseEntered { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            Phase::Pending,
            Phase::Planning,
            Phase::ExecutingStep(1),
            Phase::Finalizing
        ]
    );
    assert!(received
        .iter()
        .any(|e| matches!(e, Event::StepRecorded { step: 1, commit: Some(_), .. })));
    assert!(matches!(received.last(), Some(Event::RunCompleted { .. })));
}

#[tokio::test]
async fn test_worker_runs_submitted_requests() {
    let harness = Harness::new(ScriptedGenerator::planning(&["create LICENSE"]).step(1, license_changes()));
    let worker = Worker::start(harness.orchestrator.clone(), "test-queue", 4);

    assert!(worker.submit(RunRequest::new("", REPO)).await.is_err());

    let session_id = worker
        .submit(RunRequest::new("add a LICENSE file", REPO))
        .await
        .unwrap();
    let outcome = worker.wait(&session_id).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.session_id, session_id);
    assert_eq!(harness.record(&session_id).await.status, Phase::Completed);
    assert_eq!(worker.active_runs().await, 0);
    assert!(worker.wait("unknown").await.is_none());

    // A taken outcome is forgotten
    assert!(worker.wait(&session_id).await.is_none());
    assert!(!worker.cancel(&session_id).await);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_worker_shutdown_cancels_in_flight_runs() {
    let generator = ScriptedGenerator {
        block_plan: true,
        ..ScriptedGenerator::planning(&["never runs"])
    };
    let harness = Harness::new(generator);
    let worker = Worker::start(harness.orchestrator.clone(), "test-queue", 4);

    let session_id = worker.submit(RunRequest::new("hang", REPO)).await.unwrap();
    harness.generator.plan_started.notified().await;

    worker.shutdown().await;

    let outcome = worker.wait(&session_id).await.unwrap();
    assert_eq!(outcome.error, Some(PipelineError::Cancelled));
    assert!(harness.registry.is_empty());
    assert!(worker.submit(RunRequest::new("late", REPO)).await.is_err());
}

#[tokio::test]
async fn test_branch_collision_fails_run() {
    let harness = Harness::with_faults(
        ScriptedGenerator::planning(&["create LICENSE"]).step(1, license_changes()),
        MemoryFactory::new([("README.md", "# demo\n")]),
        Faults {
            branch_taken: true,
            ..Default::default()
        },
    );

    let request = RunRequest::new("license", REPO).with_credentials(Some(credentials()));
    let outcome = harness
        .orchestrator
        .run("s1", &request, CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, Phase::Failed);
    assert_eq!(outcome.error.as_ref().unwrap().kind(), "BranchExists");
    assert!(outcome.branch.is_none());

    // Not retried, and nothing pushed
    assert_eq!(harness.faulty.branch_attempts.load(Ordering::SeqCst), 1);
    let repo = harness.factory.repository("s1").unwrap();
    assert_eq!(repo.commits().len(), 2);
    assert!(repo.pushed().is_empty());

    let record = harness.record("s1").await;
    assert_eq!(record.status, Phase::Failed);
    assert!(record.error_detail.starts_with("[BranchExists]"));
    assert!(record.final_result.is_empty());

    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_session_lost_mid_run_is_fatal() {
    let generator = ScriptedGenerator {
        release_on_relevant: true,
        ..ScriptedGenerator::planning(&["create LICENSE", "update README.md"])
            .step(1, license_changes())
    };
    let harness = Harness::new(generator);

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("license", REPO), CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, Phase::Failed);
    let err = outcome.error.clone().unwrap();
    assert!(matches!(err, PipelineError::Step { step: 1, .. }));
    assert_eq!(err.kind(), "SessionNotFound");

    // One lookup miss: no retry, and reattach found nothing to restore
    assert_eq!(harness.faulty.reattaches.load(Ordering::SeqCst), 1);
    assert_eq!(harness.generator.calls_for(1), 0);
    assert_eq!(harness.generator.listings.lock().unwrap().len(), 1);
    assert!(outcome.steps.is_empty());
    assert!(!harness.registry.contains("s1"));

    let record = harness.record("s1").await;
    assert_eq!(record.status, Phase::Failed);
    assert!(record.error_detail.starts_with("[SessionNotFound]"));
}

#[tokio::test]
async fn test_unreadable_relevant_file_is_skipped() {
    let harness = Harness::with_faults(
        ScriptedGenerator::planning(&["mention the license in README.md"])
            .relevant(&["README.md", "NOTES.md"])
            .step(
                1,
                Ok(Changes::from([(
                    "README.md".into(),
                    "# demo\n\nMIT licensed.\n".into(),
                )])),
            ),
        MemoryFactory::new([("README.md", "# demo\n"), ("NOTES.md", "private\n")]),
        Faults {
            unreadable: Some("NOTES.md".to_string()),
            ..Default::default()
        },
    );

    let outcome = harness
        .orchestrator
        .run("s1", &RunRequest::new("license", REPO), CancellationToken::new())
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    let step = &outcome.steps[0];
    assert_eq!(step.relevant_files, vec!["README.md", "NOTES.md"]);
    assert_eq!(step.original_content.len(), 1);
    assert_eq!(step.original_content["README.md"], "# demo\n");
    assert!(!step.original_content.contains_key("NOTES.md"));
    assert!(matches!(step.commit, CommitOutcome::Committed { .. }));

    let repo = harness.factory.repository("s1").unwrap();
    assert_eq!(repo.file("README.md").as_deref(), Some("# demo\n\nMIT licensed.\n"));
}

/// Provider answering each generation shape with a canned reply, told apart
/// by the token budget each shape asks for
struct CannedLlm {
    changes: String,
    change_calls: AtomicUsize,
}

#[async_trait]
impl LLMProvider for CannedLlm {
    fn name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LLMError> {
        Ok(match request.max_tokens {
            500 => r#"[{"step": 1, "instruction": "document usage in README.md"}]"#.to_string(),
            200 => "README.md".to_string(),
            _ => {
                self.change_calls.fetch_add(1, Ordering::SeqCst);
                self.changes.clone()
            }
        })
    }
}

fn llm_run_parts(changes: &str) -> (Arc<CannedLlm>, Arc<MemoryFactory>, Orchestrator) {
    let llm = Arc::new(CannedLlm {
        changes: changes.to_string(),
        change_calls: AtomicUsize::new(0),
    });
    let factory = Arc::new(MemoryFactory::new([("README.md", "# demo\n")]));
    let dyn_factory: Arc<dyn SessionFactory> = factory.clone();
    let orchestrator = Orchestrator::new(
        Arc::new(SessionRegistry::with_factory(dyn_factory.clone())),
        dyn_factory,
        Arc::new(LlmTextGenerator::new(llm.clone())),
        Arc::new(MemoryStatusStore::new()),
        Arc::new(MessageBus::new()),
        settings(),
    );
    (llm, factory, orchestrator)
}

#[tokio::test]
async fn test_generated_file_with_code_block_is_committed() {
    let reply = "```json\n{\"README.md\": \"# Demo\\n\\n```sh\\ncargo run\\n```\\n\"}\n```";
    let (_, factory, orchestrator) = llm_run_parts(reply);

    let outcome = orchestrator
        .run("s1", &RunRequest::new("document usage", REPO), CancellationToken::new())
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert!(matches!(outcome.steps[0].commit, CommitOutcome::Committed { .. }));
    let repo = factory.repository("s1").unwrap();
    assert_eq!(
        repo.file("README.md").as_deref(),
        Some("# Demo\n\n```sh\ncargo run\n```\n")
    );
}

#[tokio::test]
async fn test_unparseable_changes_fail_the_step() {
    let (llm, factory, orchestrator) =
        llm_run_parts("I updated the README to document usage for you.");

    let outcome = orchestrator
        .run("s1", &RunRequest::new("document usage", REPO), CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, Phase::Failed);
    let err = outcome.error.unwrap();
    assert!(matches!(err, PipelineError::Step { step: 1, .. }));
    assert_eq!(err.kind(), "TextGeneration");
    assert!(outcome.branch.is_none());

    // Retried as a transient generation failure, then given up
    assert_eq!(llm.change_calls.load(Ordering::SeqCst), 3);
    let repo = factory.repository("s1").unwrap();
    assert_eq!(repo.commits().len(), 1);
    assert_eq!(repo.branches().len(), 1);
}
