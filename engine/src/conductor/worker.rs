//! In-process worker
//!
//! Accepts [`RunRequest`]s on a bounded queue, assigns each a session ID and
//! runs its orchestration on its own task. Callers get the session ID back as
//! soon as the request is queued and can either poll the status store or
//! [`Worker::wait`] for the outcome.

use crate::conductor::orchestrator::Orchestrator;
use crate::conductor::types::{RunOutcome, RunRequest};
use sdk::errors::PipelineError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

struct Job {
    session_id: String,
    request: RunRequest,
    cancel: CancellationToken,
    done: watch::Sender<Option<RunOutcome>>,
}

struct RunEntry {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

pub struct Worker {
    task_queue: String,
    sender: mpsc::Sender<Job>,
    runs: Mutex<HashMap<String, RunEntry>>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        task_queue: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let task_queue = task_queue.into();
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let shutdown = CancellationToken::new();

        let dispatcher = tokio::spawn(
            dispatch(orchestrator, receiver, shutdown.clone())
                .instrument(info_span!("worker", task_queue = %task_queue)),
        );
        info!(task_queue = %task_queue, capacity, "worker started");

        Self {
            task_queue,
            sender,
            runs: Mutex::new(HashMap::new()),
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Queue a run and return its session ID.
    ///
    /// Waits for queue space when the queue is full.
    pub async fn submit(&self, request: RunRequest) -> Result<String, PipelineError> {
        request.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        let (done, outcome) = watch::channel(None);

        self.runs.lock().await.insert(
            session_id.clone(),
            RunEntry {
                cancel: cancel.clone(),
                outcome,
            },
        );

        let job = Job {
            session_id: session_id.clone(),
            request,
            cancel,
            done,
        };
        if self.sender.send(job).await.is_err() {
            self.runs.lock().await.remove(&session_id);
            return Err(PipelineError::Cancelled);
        }

        info!(session_id = %session_id, task_queue = %self.task_queue, "run queued");
        Ok(session_id)
    }

    /// Wait for a submitted run to finish. `None` for an unknown session ID
    /// or a run whose task died without an outcome.
    ///
    /// The outcome is handed out once: the run is forgotten after it is taken.
    pub async fn wait(&self, session_id: &str) -> Option<RunOutcome> {
        let mut outcome = self.runs.lock().await.get(session_id)?.outcome.clone();
        let finished = match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        self.runs.lock().await.remove(session_id);
        finished
    }

    /// Cancel one run. Returns false for an unknown session ID.
    pub async fn cancel(&self, session_id: &str) -> bool {
        match self.runs.lock().await.get(session_id) {
            Some(entry) => {
                info!(session_id = %session_id, "cancelling run");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs submitted but not yet finished
    pub async fn active_runs(&self) -> usize {
        self.runs
            .lock()
            .await
            .values()
            .filter(|entry| entry.outcome.borrow().is_none())
            .count()
    }

    /// Cancel every run and wait for their teardown to finish.
    pub async fn shutdown(&self) {
        info!(task_queue = %self.task_queue, "worker shutting down");
        self.shutdown.cancel();

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "worker dispatcher panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch(
    orchestrator: Arc<Orchestrator>,
    mut receiver: mpsc::Receiver<Job>,
    shutdown: CancellationToken,
) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => spawn_run(&mut running, &orchestrator, job),
                None => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "run task panicked");
                }
            }
        }
    }

    // Queued jobs still get a terminal status; their tokens are already cancelled.
    receiver.close();
    while let Some(job) = receiver.recv().await {
        spawn_run(&mut running, &orchestrator, job);
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "run task panicked");
        }
    }
    info!("worker stopped");
}

fn spawn_run(running: &mut JoinSet<()>, orchestrator: &Arc<Orchestrator>, job: Job) {
    let orchestrator = Arc::clone(orchestrator);
    running.spawn(
        async move {
            let outcome = orchestrator
                .run(&job.session_id, &job.request, job.cancel)
                .await;
            if !outcome.is_success() {
                warn!(session_id = %outcome.session_id, "run did not complete");
            }
            job.done.send_replace(Some(outcome));
        }
        .in_current_span(),
    );
}
