//! Runtime Builder API
//!
//! Assembles the protocol reactor, execution pool, distributed scheduler and
//! lifecycle manager from one `IngressConfig` and hands back an
//! `IngressRuntime` that deploys and undeploys endpoints.

use crate::processor::{ExecutionEngine, ExecutionPool, MessageProcessor, ProcessorSettings};
use crate::reactor::ProtocolReactor;
use crate::supervisor::EndpointLifecycleManager;
use crate::tasks::{DistributedScheduler, StandaloneScheduler};
use inflow_core::{
    AckGenerator, EndpointConfig, InflowError, InflowResult, IngressConfig, MessageParser,
    PollTask, SegmentAckGenerator, SegmentParser,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for an ingestion runtime
pub struct RuntimeBuilder {
    config: IngressConfig,
    engine: Option<Arc<dyn ExecutionEngine>>,
    scheduler: Option<Arc<dyn DistributedScheduler>>,
    parser: Arc<dyn MessageParser>,
    acks: Arc<dyn AckGenerator>,
}

impl RuntimeBuilder {
    pub fn new(config: IngressConfig) -> Self {
        Self {
            config,
            engine: None,
            scheduler: None,
            parser: Arc::new(SegmentParser),
            acks: Arc::new(SegmentAckGenerator),
        }
    }

    /// Set the engine decoded messages are submitted to
    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Use a cluster scheduler instead of the in-process one
    pub fn with_scheduler(mut self, scheduler: Arc<dyn DistributedScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn MessageParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_ack_generator(mut self, acks: Arc<dyn AckGenerator>) -> Self {
        self.acks = acks;
        self
    }

    /// Validate the configuration and construct every component
    ///
    /// Nothing is bound or scheduled until endpoints are deployed.
    pub fn build(self) -> InflowResult<IngressRuntime> {
        self.config.validate()?;
        let engine = self
            .engine
            .ok_or_else(|| InflowError::config_error("an execution engine is required"))?;

        let scheduler: Arc<dyn DistributedScheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(StandaloneScheduler::new(&self.config.scheduler)?),
        };
        let pool = Arc::new(ExecutionPool::new(&self.config.execution)?);
        let reactor = Arc::new(ProtocolReactor::new(self.config.reactor.clone()));
        let manager = EndpointLifecycleManager::new(
            reactor.clone(),
            Some(scheduler),
            self.config.scheduler.clone(),
        );

        info!(
            io_threads = self.config.reactor.io_threads,
            worker_threads = self.config.execution.worker_threads,
            endpoints = self.config.endpoints.len(),
            "Ingestion runtime built"
        );

        Ok(IngressRuntime {
            config: self.config,
            engine,
            parser: self.parser,
            acks: self.acks,
            pool,
            reactor,
            manager,
            shut_down: AtomicBool::new(false),
        })
    }
}

// ----------------------------------------------------------------------------
// Ingress Runtime
// ----------------------------------------------------------------------------

/// A built ingestion runtime
pub struct IngressRuntime {
    config: IngressConfig,
    engine: Arc<dyn ExecutionEngine>,
    parser: Arc<dyn MessageParser>,
    acks: Arc<dyn AckGenerator>,
    pool: Arc<ExecutionPool>,
    reactor: Arc<ProtocolReactor>,
    manager: EndpointLifecycleManager,
    shut_down: AtomicBool,
}

impl IngressRuntime {
    pub fn config(&self) -> &IngressConfig {
        &self.config
    }

    pub fn manager(&self) -> &EndpointLifecycleManager {
        &self.manager
    }

    pub fn reactor(&self) -> &Arc<ProtocolReactor> {
        &self.reactor
    }

    /// Start a polling endpoint running `task`
    pub fn deploy_polling(
        &self,
        config: &EndpointConfig,
        task: Arc<dyn PollTask>,
    ) -> InflowResult<()> {
        self.ensure_running()?;
        let mut config = config.clone();
        config.normalize();
        self.manager.start_endpoint(&config, task)
    }

    /// Bind a listening endpoint, serving it with the runtime's engine
    pub fn deploy_listener(&self, config: &EndpointConfig) -> InflowResult<Arc<MessageProcessor>> {
        self.ensure_running()?;
        let mut config = config.clone();
        config.normalize();
        let listener = config.listener_settings().ok_or_else(|| {
            InflowError::unsupported(&config.name, "deploy a polling endpoint as a listener")
        })?;

        let settings = ProcessorSettings {
            sequence: config.sequence.clone(),
            error_sequence: config.error_sequence.clone(),
            ..ProcessorSettings::new(config.name.clone(), &listener)
        };
        let processor = Arc::new(MessageProcessor::new(
            settings,
            self.engine.clone(),
            self.parser.clone(),
            self.acks.clone(),
            self.pool.clone(),
        ));
        self.manager
            .start_listening_endpoint(&config, processor.clone())?;
        Ok(processor)
    }

    /// Deploy every listening endpoint of the configuration
    ///
    /// Polling endpoints need a task and are deployed with `deploy_polling`.
    pub fn deploy_configured_listeners(&self) -> InflowResult<usize> {
        let listeners: Vec<EndpointConfig> = self
            .config
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.is_listening())
            .cloned()
            .collect();
        for endpoint in &listeners {
            self.deploy_listener(endpoint)?;
        }
        Ok(listeners.len())
    }

    /// Stop and discard an endpoint; `false` if it was not deployed
    pub fn undeploy(&self, name: &str) -> bool {
        self.manager.stop_endpoint(name)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop every endpoint, the reactor and the execution pool
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let stopped = self.manager.shutdown();
        self.reactor.stop();
        self.pool.shutdown();
        info!(stopped_endpoints = stopped, "Ingestion runtime shut down");
    }

    fn ensure_running(&self) -> InflowResult<()> {
        if self.is_shut_down() {
            return Err(InflowError::channel_error("ingestion runtime has been shut down"));
        }
        Ok(())
    }
}

impl Drop for IngressRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
