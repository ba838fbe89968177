//! Agent framework: lifecycle, subscription, and task consumption
//!
//! [`AgentRuntime`] wraps a role implementation with everything the bus
//! contract demands: at-most-once processing per (task, agent) pair through
//! a correlation-id cache, bounded in-flight concurrency, cancel handling
//! from `system.control`, and a graceful drain on shutdown. Role
//! implementations see one assignment in and one outcome out; every retry
//! decision lives elsewhere.

pub mod architect;
pub mod coder;
pub mod debugger;
pub mod tester;

pub use architect::ArchitectAgent;
pub use coder::CoderAgent;
pub use debugger::{BranchProposal, DebuggerAgent};
pub use tester::TesterAgent;

use crate::bus::{channels, BusError, EventHandler, HandlerError, MessageBus, SubscriptionToken};
use crate::protocol::{Event, EventPayload, TaskAssignment, TaskFailure, TaskOutput};
use crate::workflow::AgentRole;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A role implementation: consume one assignment, produce one outcome.
#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;
    async fn execute(&self, assignment: TaskAssignment) -> Result<TaskOutput, TaskFailure>;
}

/// Runtime limits for one agent instance.
#[derive(Debug, Clone)]
pub struct AgentRuntimeConfig {
    pub agent_id: String,
    pub max_in_flight: usize,
    pub drain_timeout: Duration,
}

impl AgentRuntimeConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            max_in_flight: 1,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Bounded correlation-id cache for delivery dedup.
struct DedupCache {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false when the id was already recorded.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

struct ForwardToQueue {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl EventHandler for ForwardToQueue {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        self.tx
            .send(event)
            .map_err(|_| HandlerError::new("agent runtime stopped"))
    }
}

/// Hosts one [`Agent`] on the bus.
pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    bus: Arc<dyn MessageBus>,
    config: AgentRuntimeConfig,
    semaphore: Arc<Semaphore>,
    dedup: Arc<Mutex<DedupCache>>,
    cancels: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
    shutdown: watch::Sender<bool>,
    subscriptions: Mutex<Vec<SubscriptionToken>>,
}

impl AgentRuntime {
    pub fn new(
        agent: Arc<dyn Agent>,
        bus: Arc<dyn MessageBus>,
        config: AgentRuntimeConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            agent,
            bus,
            config,
            dedup: Arc::new(Mutex::new(DedupCache::new(1024))),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to the role channel and the control channel, then start the
    /// consumer loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        let (task_tx, mut task_rx) = mpsc::unbounded_channel();
        let task_token = self
            .bus
            .subscribe(
                &channels::task_channel(self.agent.role()),
                Arc::new(ForwardToQueue { tx: task_tx }),
            )
            .await?;

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let control_token = self
            .bus
            .subscribe(
                channels::SYSTEM_CONTROL,
                Arc::new(ForwardToQueue { tx: control_tx }),
            )
            .await?;

        {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.push(task_token);
            subscriptions.push(control_token);
        }

        // Cancel listener: flips the per-task flag for in-flight work.
        let cancels = self.cancels.clone();
        let mut cancel_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = control_rx.recv() => {
                        let Some(event) = event else { break };
                        if let EventPayload::TaskCancelRequested { .. } = event.payload {
                            if let Some(task_id) = &event.task_id {
                                let cancels = cancels.lock().await;
                                if let Some(flag) = cancels.get(task_id) {
                                    let _ = flag.send(true);
                                }
                            }
                        }
                    }
                    _ = cancel_shutdown.changed() => break,
                }
            }
        });

        // Consumer loop: dedup, admit under the concurrency bound, spawn.
        let runtime = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = task_rx.recv() => {
                        let Some(event) = event else { break };
                        runtime.consume(event).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(agent_id = %runtime.config.agent_id, "consumer loop stopping");
                        break;
                    }
                }
            }
        });

        info!(
            agent_id = %self.config.agent_id,
            role = %self.agent.role(),
            "agent runtime started"
        );
        Ok(())
    }

    async fn consume(self: &Arc<Self>, event: Event) {
        let EventPayload::TaskDispatched { assignment } = event.payload.clone() else {
            return;
        };
        if assignment.role != self.agent.role() {
            return;
        }

        // At-most-once per (task, agent): replays of the same dispatch are
        // absorbed here.
        if !self.dedup.lock().await.insert(event.correlation_id) {
            debug!(
                agent_id = %self.config.agent_id,
                task_id = %assignment.task_id,
                "duplicate dispatch ignored"
            );
            return;
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .await
            .insert(assignment.task_id.clone(), cancel_tx);

        let runtime = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let workflow_id = event.workflow_id.clone();
            let correlation_id = event.correlation_id;
            let task_id = assignment.task_id.clone();

            runtime
                .publish_result(
                    &workflow_id,
                    &task_id,
                    correlation_id,
                    EventPayload::AgentTaskStarted {
                        agent_id: runtime.config.agent_id.clone(),
                    },
                )
                .await;

            let outcome = tokio::select! {
                outcome = runtime.agent.execute(assignment) => outcome,
                _ = cancel_rx.changed() => {
                    warn!(task_id = %task_id, "task cancelled mid-flight");
                    Err(TaskFailure {
                        message: "cancelled by orchestrator".to_string(),
                        class: Some(crate::workflow::FailureClass::Timeout),
                        stderr_excerpt: None,
                        test_report: None,
                    })
                }
            };

            runtime.cancels.lock().await.remove(&task_id);

            match outcome {
                Ok(output) => {
                    if let Some(report) = &output.test_report {
                        runtime
                            .publish_test_result(&workflow_id, &task_id, correlation_id, report, true)
                            .await;
                    }
                    runtime
                        .publish_result(
                            &workflow_id,
                            &task_id,
                            correlation_id,
                            EventPayload::AgentTaskCompleted {
                                agent_id: runtime.config.agent_id.clone(),
                                output,
                            },
                        )
                        .await;
                }
                Err(failure) => {
                    if let Some(report) = &failure.test_report {
                        runtime
                            .publish_test_result(&workflow_id, &task_id, correlation_id, report, false)
                            .await;
                    }
                    runtime
                        .publish_result(
                            &workflow_id,
                            &task_id,
                            correlation_id,
                            EventPayload::AgentTaskFailed {
                                agent_id: runtime.config.agent_id.clone(),
                                failure,
                            },
                        )
                        .await;
                }
            }
        });
    }

    async fn publish_result(
        &self,
        workflow_id: &str,
        task_id: &str,
        correlation_id: Uuid,
        payload: EventPayload,
    ) {
        let event = Event::correlated(
            self.config.agent_id.clone(),
            workflow_id,
            Some(task_id.to_string()),
            correlation_id,
            payload,
        );
        if let Err(e) = self.bus.publish(channels::AGENT_RESULTS, event).await {
            warn!(
                agent_id = %self.config.agent_id,
                task_id = %task_id,
                error = %e,
                "failed to publish agent result"
            );
        }
    }

    async fn publish_test_result(
        &self,
        workflow_id: &str,
        task_id: &str,
        correlation_id: Uuid,
        report: &crate::protocol::TestReport,
        passed: bool,
    ) {
        let payload = if passed {
            EventPayload::TestPassed {
                report: report.clone(),
            }
        } else {
            EventPayload::TestFailed {
                report: report.clone(),
            }
        };
        let event = Event::correlated(
            self.config.agent_id.clone(),
            workflow_id,
            Some(task_id.to_string()),
            correlation_id,
            payload,
        );
        if let Err(e) = self.bus.publish(channels::TEST_RESULTS, event).await {
            warn!(task_id = %task_id, error = %e, "failed to publish test result");
        }
    }

    /// Stop consuming and wait for in-flight work to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let drained = tokio::time::timeout(
            self.config.drain_timeout,
            self.semaphore
                .acquire_many(self.config.max_in_flight as u32),
        )
        .await;
        match drained {
            Ok(Ok(permits)) => drop(permits),
            _ => warn!(
                agent_id = %self.config.agent_id,
                "drain timeout elapsed with work still in flight"
            ),
        }

        let tokens: Vec<SubscriptionToken> = self.subscriptions.lock().await.drain(..).collect();
        for token in tokens {
            let _ = self.bus.unsubscribe(token).await;
        }
        info!(agent_id = %self.config.agent_id, "agent runtime stopped");
    }
}

/// Pull the first fenced code block out of an LLM reply, or the whole reply
/// when there is no fence.
pub(crate) fn extract_code_block(content: &str) -> String {
    let Some(open) = content.find("```") else {
        return content.trim().to_string();
    };
    let after_fence = &content[open + 3..];
    // Skip the language tag line.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}
