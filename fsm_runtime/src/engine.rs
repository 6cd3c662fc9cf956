//! Persistent FSM engine (spec §4.5): a builder registers a named action
//! and its strictly ordered states; the engine drives a run's transitions,
//! persisting a checkpoint after each one, and supports resuming every
//! `doing` run on process start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;

use pipeline_api::error::{FsmError, InternalError, ManagerError, ReportError};

use crate::store::{FsmStore, RunTerminal};
use crate::types::{Req, RetryPolicy, RunStatus, StartOptions, StepOutcome};

const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct FsmContext {
    pub run_id: i64,
    pub correlation_id: String,
}

pub type TransitionFn<R, W> =
    Arc<dyn Fn(&FsmContext, &mut Req<R, W>) -> Result<StepOutcome<W>, ManagerError> + Send + Sync>;

/// Per-process registry of named concurrency queues (spec §4.5 "Queuing").
#[derive(Clone, Default)]
pub struct QueueRegistry(Arc<Mutex<HashMap<String, Arc<Semaphore>>>>);

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, capacity: usize) {
        self.0
            .lock()
            .expect("queue registry mutex poisoned")
            .insert(name.into(), Arc::new(Semaphore::new(capacity.max(1))));
    }

    fn get(&self, name: &str) -> Option<Arc<Semaphore>> {
        self.0.lock().expect("queue registry mutex poisoned").get(name).cloned()
    }
}

struct Inner<R, W> {
    action: String,
    states: Vec<(String, TransitionFn<R, W>)>,
    store: Arc<FsmStore>,
    queues: QueueRegistry,
    retry_policy: RetryPolicy,
}

pub struct FsmEngine<R, W>(Arc<Inner<R, W>>);

impl<R, W> Clone for FsmEngine<R, W> {
    fn clone(&self) -> Self {
        FsmEngine(self.0.clone())
    }
}

pub struct Builder<R, W> {
    action: String,
    states: Vec<(String, TransitionFn<R, W>)>,
    retry_policy: RetryPolicy,
}

impl<R, W> Builder<R, W>
where
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
    W: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(action: impl Into<String>) -> Self {
        Builder {
            action: action.into(),
            states: Vec::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Appends the next state in the sequence. The first call establishes
    /// `start`; the FSM completes once the last registered state's
    /// transition returns `Advance`.
    pub fn state(
        mut self,
        name: impl Into<String>,
        transition: impl Fn(&FsmContext, &mut Req<R, W>) -> Result<StepOutcome<W>, ManagerError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.states.push((name.into(), Arc::new(transition)));
        self
    }

    pub fn build(self, store: Arc<FsmStore>, queues: QueueRegistry) -> FsmEngine<R, W> {
        assert!(!self.states.is_empty(), "an FSM must register at least one state");
        FsmEngine(Arc::new(Inner {
            action: self.action,
            states: self.states,
            store,
            queues,
            retry_policy: self.retry_policy,
        }))
    }
}

impl<R, W> FsmEngine<R, W>
where
    R: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    W: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    pub fn action(&self) -> &str {
        &self.0.action
    }

    /// Writes a new run row and enqueues it for execution (spec §4.5
    /// "Starting a run"). Returns the run's unique version (its row id)
    /// immediately; execution happens on a background task.
    pub async fn start(
        &self,
        correlation_id: &str,
        request: R,
        options: StartOptions,
    ) -> Result<i64, ManagerError> {
        let request_json = serde_json::to_string(&request).structured(FsmError::RunCreateFailed {
            action: self.0.action.clone(),
        })?;
        let first_state = self.0.states[0].0.clone();

        let run_id = self
            .0
            .store
            .create_run(
                &self.0.action,
                correlation_id,
                &first_state,
                &request_json,
                options.queue.as_deref(),
                options.run_after,
                options.parent,
                options.delay_until,
            )
            .structured(FsmError::RunCreateFailed {
                action: self.0.action.clone(),
            })?;

        let engine = self.clone();
        let queue_name = options.queue.clone();
        let delay_until = options.delay_until;
        let run_after = options.run_after;
        let transition_timeout = options.transition_timeout;

        tokio::spawn(async move {
            if let Some(at) = delay_until {
                let now = Utc::now();
                if at > now {
                    tokio::time::sleep((at - now).to_std().unwrap_or(Duration::ZERO)).await;
                }
            }
            if let Some(dep) = run_after {
                engine.wait_terminal(dep).await;
            }
            let _permit = match queue_name.as_deref().and_then(|q| engine.0.queues.get(q)) {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            engine.drive(run_id, transition_timeout).await;
        });

        Ok(run_id)
    }

    /// Blocks until `run_id` reaches a terminal status (spec §4.5 "Wait").
    pub async fn wait(&self, run_id: i64) -> Result<W, ManagerError> {
        loop {
            let row = self
                .0
                .store
                .fetch_run(run_id)
                .structured(FsmError::RunNotFound { run_id })?
                .structured(FsmError::RunNotFound { run_id })?;
            let status = RunStatus::from_str(&row.status);
            if status.is_terminal() {
                return match status {
                    RunStatus::Completed => {
                        let resp_json = row.response_json.structured(FsmError::RunNotFound { run_id })?;
                        serde_json::from_str(&resp_json)
                            .structured(FsmError::RunNotFound { run_id })
                    }
                    _ => {
                        let message = row.error_json.unwrap_or_else(|| "FSM run failed".to_string());
                        Err(ManagerError::new(InternalError::Internal(message)))
                    }
                };
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_terminal(&self, run_id: i64) {
        loop {
            match self.0.store.fetch_run(run_id) {
                Ok(Some(row)) if RunStatus::from_str(&row.status).is_terminal() => return,
                Ok(Some(_)) => {}
                _ => return,
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Re-enters every `doing` run for this action (spec §4.5 "Resume").
    /// Errors are logged, never propagated.
    pub async fn resume(&self) {
        let ids = match self.0.store.doing_runs(&self.0.action) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to enumerate in-progress '{}' runs for resume: {e:#}", self.0.action);
                return;
            }
        };
        for run_id in ids {
            info!("Resuming run {run_id} for action '{}'", self.0.action);
            let engine = self.clone();
            tokio::spawn(async move {
                engine.drive(run_id, None).await;
            });
        }
    }

    fn build_req(
        &self,
        run_id: i64,
        request_json: &str,
        response_json: Option<&str>,
    ) -> Result<Req<R, W>, ManagerError> {
        let request: R =
            serde_json::from_str(request_json).structured(FsmError::RunNotFound { run_id })?;
        let response: Option<W> = match response_json {
            Some(j) => Some(serde_json::from_str(j).structured(FsmError::RunNotFound { run_id })?),
            None => None,
        };
        Ok(Req { request, response })
    }

    async fn drive(&self, run_id: i64, transition_timeout: Option<Duration>) {
        let row = match self.0.store.fetch_run(run_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                error!("Run {run_id} vanished before execution could start");
                return;
            }
            Err(e) => {
                error!("Failed to load run {run_id}: {e:#}");
                return;
            }
        };

        let mut req = match self.build_req(run_id, &row.request_json, row.response_json.as_deref()) {
            Ok(req) => req,
            Err(e) => {
                let _ = self.0.store.finish(
                    run_id,
                    RunTerminal::Failed,
                    &row.current_state,
                    None,
                    Some(&e.to_string()),
                );
                return;
            }
        };

        let Some(mut state_idx) = self.0.states.iter().position(|(n, _)| *n == row.current_state) else {
            let _ = self.0.store.finish(
                run_id,
                RunTerminal::Failed,
                &row.current_state,
                None,
                Some(&format!("unknown state '{}'", row.current_state)),
            );
            return;
        };

        let budget = transition_timeout.unwrap_or(DEFAULT_TRANSITION_TIMEOUT);

        while state_idx < self.0.states.len() {
            let (state_name, transition) = self.0.states[state_idx].clone();
            let ctx = FsmContext {
                run_id,
                correlation_id: row.correlation_id.clone(),
            };

            let mut attempt = 0u32;
            let step = loop {
                // Run the (synchronous, possibly blocking) transition on a
                // dedicated thread so the budget below can actually cut the
                // run loop loose from it instead of merely timestamping it.
                let ctx_for_task = ctx.clone();
                let transition_for_task = transition.clone();
                let mut req_for_task = req.clone();
                let join = tokio::task::spawn_blocking(move || {
                    let outcome = transition_for_task(&ctx_for_task, &mut req_for_task);
                    (outcome, req_for_task)
                });

                let result: Result<StepOutcome<W>, ManagerError> = match tokio::time::timeout(budget, join).await
                {
                    Ok(Ok((outcome, updated_req))) => {
                        req = updated_req;
                        outcome
                    }
                    Ok(Err(join_err)) => Err(ManagerError::new(InternalError::Internal(format!(
                        "transition '{state_name}' panicked: {join_err}"
                    )))),
                    Err(_elapsed) => {
                        Err(ManagerError::new(FsmError::TransitionTimeout { state: state_name.clone() }))
                    }
                };

                match result {
                    Ok(outcome) => break Ok(outcome),
                    Err(e) if attempt + 1 >= self.0.retry_policy.max_attempts => {
                        break Err(e);
                    }
                    Err(e) => {
                        warn!(
                            "Transition '{state_name}' on run {run_id} failed (attempt {}): {e}",
                            attempt + 1
                        );
                        tokio::time::sleep(self.0.retry_policy.delay_for(attempt)).await;
                        attempt += 1;
                    }
                }
            };

            match step {
                Ok(StepOutcome::Advance(w)) => {
                    req.response = Some(w.clone());
                    let response_json = serde_json::to_string(&w).ok();
                    state_idx += 1;
                    let next_state = self
                        .0
                        .states
                        .get(state_idx)
                        .map(|(n, _)| n.as_str())
                        .unwrap_or(&state_name);
                    if let Err(e) = self.0.store.advance(run_id, next_state, response_json.as_deref()) {
                        error!("Failed to persist advance for run {run_id}: {e:#}");
                        return;
                    }
                    if state_idx >= self.0.states.len() {
                        let _ = self.0.store.finish(
                            run_id,
                            RunTerminal::Completed,
                            &state_name,
                            response_json.as_deref(),
                            None,
                        );
                        return;
                    }
                }
                Ok(StepOutcome::Handoff(w)) => {
                    let response_json = serde_json::to_string(&w).ok();
                    let _ = self.0.store.finish(
                        run_id,
                        RunTerminal::Completed,
                        &state_name,
                        response_json.as_deref(),
                        None,
                    );
                    return;
                }
                Ok(StepOutcome::Abort(e)) => {
                    let _ = self.0.store.finish(
                        run_id,
                        RunTerminal::Aborted,
                        &state_name,
                        None,
                        Some(&e.to_string()),
                    );
                    return;
                }
                Ok(StepOutcome::Unrecoverable(e)) => {
                    let _ = self.0.store.finish(
                        run_id,
                        RunTerminal::Failed,
                        &state_name,
                        None,
                        Some(&e.to_string()),
                    );
                    return;
                }
                Err(e) => {
                    warn!("Retry budget exhausted for transition '{state_name}' on run {run_id}: {e}");
                    // Run stays 'doing' at current_state; a future `resume` retries it.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    struct Req1 {
        n: i64,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    struct Resp1 {
        n: i64,
    }

    fn test_engine() -> FsmEngine<Req1, Resp1> {
        let store = Arc::new(FsmStore::open_in_memory().unwrap());
        let queues = QueueRegistry::new();
        Builder::new("test-action")
            .state("start", |_ctx, req: &mut Req<Req1, Resp1>| {
                Ok(StepOutcome::Advance(Resp1 { n: req.request.n + 1 }))
            })
            .state("end", |_ctx, req: &mut Req<Req1, Resp1>| {
                let n = req.response.as_ref().map(|r| r.n).unwrap_or(0);
                Ok(StepOutcome::Advance(Resp1 { n: n + 1 }))
            })
            .build(store, queues)
    }

    #[tokio::test]
    async fn run_completes_through_all_states() {
        let engine = test_engine();
        let run_id = engine.start("corr-1", Req1 { n: 0 }, StartOptions::new()).await.unwrap();
        let result = engine.wait(run_id).await.unwrap();
        assert_eq!(result.n, 2);
    }

    #[tokio::test]
    async fn handoff_short_circuits_remaining_states() {
        let store = Arc::new(FsmStore::open_in_memory().unwrap());
        let queues = QueueRegistry::new();
        let engine: FsmEngine<Req1, Resp1> = Builder::new("handoff-action")
            .state("start", |_ctx, req: &mut Req<Req1, Resp1>| {
                Ok(StepOutcome::Handoff(Resp1 { n: req.request.n }))
            })
            .state("end", |_ctx, _req: &mut Req<Req1, Resp1>| {
                panic!("must not run after handoff")
            })
            .build(store, queues);

        let run_id = engine.start("corr-2", Req1 { n: 7 }, StartOptions::new()).await.unwrap();
        let result = engine.wait(run_id).await.unwrap();
        assert_eq!(result.n, 7);
    }

    #[tokio::test]
    async fn abort_surfaces_as_error() {
        let store = Arc::new(FsmStore::open_in_memory().unwrap());
        let queues = QueueRegistry::new();
        let engine: FsmEngine<Req1, Resp1> = Builder::new("abort-action")
            .state("start", |_ctx, _req: &mut Req<Req1, Resp1>| {
                Ok(StepOutcome::Abort(ManagerError::new(InternalError::Internal(
                    "validation failed".to_string(),
                ))))
            })
            .build(store, queues);

        let run_id = engine.start("corr-3", Req1 { n: 0 }, StartOptions::new()).await.unwrap();
        assert!(engine.wait(run_id).await.is_err());
    }

    #[tokio::test]
    async fn resume_reenters_doing_runs() {
        let store = Arc::new(FsmStore::open_in_memory().unwrap());
        let queues = QueueRegistry::new();

        // Simulate a run stuck in 'doing' at 'end' as if the process restarted
        // mid-FSM.
        let run_id = store
            .create_run("resume-action", "corr-4", "end", "{\"n\":10}", None, None, None, None)
            .unwrap();

        let engine: FsmEngine<Req1, Resp1> = Builder::new("resume-action")
            .state("start", |_ctx, req: &mut Req<Req1, Resp1>| {
                Ok(StepOutcome::Advance(Resp1 { n: req.request.n }))
            })
            .state("end", |_ctx, req: &mut Req<Req1, Resp1>| {
                Ok(StepOutcome::Advance(Resp1 { n: req.request.n + 1 }))
            })
            .build(store, queues);

        engine.resume().await;
        let result = engine.wait(run_id).await.unwrap();
        assert_eq!(result.n, 11);
    }
}
