//! Wiring of store, job stream, executor and configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use debate_state::{
    DebateStore, JobQueue, MemoryDebateStore, MemoryJobQueue, ANALYSIS_STREAM,
};

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::dispatch::{AgentExecutor, Dispatcher, WorkerPool};
use crate::error::Result;

/// A coordinator plus the in-process workers that serve it.
///
/// Workers are optional: a deployment may run them in separate processes
/// against the same store and stream, in which case this process only
/// coordinates.
pub struct DebateEngine {
    config: Arc<EngineConfig>,
    dispatcher: Arc<Dispatcher>,
    coordinator: Coordinator,
    workers: Option<WorkerPool>,
}

impl DebateEngine {
    pub fn new(
        store: Arc<dyn DebateStore>,
        queue: Arc<dyn JobQueue>,
        executor: Arc<dyn AgentExecutor>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            queue,
            executor,
            Arc::clone(&config),
        ));
        let coordinator = Coordinator::new(store, Arc::clone(&dispatcher), Arc::clone(&config))?;
        Ok(Self {
            config,
            dispatcher,
            coordinator,
            workers: None,
        })
    }

    /// In-memory store and stream; nothing survives the process.
    pub fn ephemeral(executor: Arc<dyn AgentExecutor>, config: EngineConfig) -> Result<Self> {
        let queue = MemoryJobQueue::new().with_max_depth(ANALYSIS_STREAM, config.queue.max_depth);
        Self::new(
            Arc::new(MemoryDebateStore::new()),
            Arc::new(queue),
            executor,
            config,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Spawn `config.workers` workers on the current runtime. Idempotent.
    pub fn start_workers(&mut self) {
        if self.workers.is_some() {
            return;
        }
        info!(workers = self.config.workers, "starting dispatcher workers");
        self.workers = Some(WorkerPool::spawn(
            Arc::clone(&self.dispatcher),
            self.config.workers,
        ));
    }

    /// Stop the workers, giving in-flight runs the claim grace period.
    pub async fn shutdown(mut self) {
        if let Some(workers) = self.workers.take() {
            workers
                .shutdown(Duration::from_secs(self.config.timeouts.claim_grace_secs))
                .await;
        }
    }
}
