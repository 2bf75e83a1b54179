//! Message processing for listening endpoints
//!
//! The `MessageProcessor` turns a decoded frame into an `InboundMessage`,
//! hands it to the execution engine on the `ExecutionPool`, and decides what
//! the connection writes back: an immediate ACK/NACK in auto-ack mode, or
//! whatever the engine later supplies through a `Responder`.

use crate::managers::delivery::{CompletionOutcome, RequestCorrelator};
use crate::reactor::ConnectionLink;
use async_trait::async_trait;
use inflow_core::{
    AckGenerator, ConnectionKey, ContentError, ExecutionConfig, ExecutionError, InboundMessage,
    InflowError, InflowResult, ListenerSettings, MessageId, MessageParser, OutboundMessage,
    Response,
};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

// ----------------------------------------------------------------------------
// Execution Engine Interface
// ----------------------------------------------------------------------------

/// A decoded message handed to the execution engine
#[derive(Debug)]
pub struct ExecutionRequest {
    /// Name of the endpoint the message arrived on
    pub endpoint: String,
    /// Sequence that should process the message
    pub sequence: Option<String>,
    pub message: InboundMessage,
    /// Present when the engine must supply the response itself
    pub responder: Option<Responder>,
    /// Set when the message failed content validation
    pub failure: Option<ContentError>,
}

/// The mediation engine decoded messages are submitted to
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<(), ExecutionError>;
}

/// Completes one pending exchange on behalf of the engine
#[derive(Clone)]
pub struct Responder {
    message_id: MessageId,
    correlator: RequestCorrelator,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("message_id", &self.message_id)
            .finish()
    }
}

impl Responder {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn complete(&self, response: Response) -> CompletionOutcome {
        self.correlator.complete(self.message_id, response)
    }

    /// Send the response, then close the connection
    pub fn complete_then_close(&self, response: Response) -> CompletionOutcome {
        self.correlator.complete_then_close(self.message_id, response)
    }
}

// ----------------------------------------------------------------------------
// Execution Pool
// ----------------------------------------------------------------------------

/// Worker pool running engine submissions and response timers
///
/// Kept separate from the reactor so slow executions never run on an I/O
/// thread.
pub struct ExecutionPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl ExecutionPool {
    pub fn new(config: &ExecutionConfig) -> InflowResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("inflow-exec")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Stop the pool without waiting for in-flight work
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!("Execution pool shut down");
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Message Processor
// ----------------------------------------------------------------------------

/// Per-endpoint processing parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub endpoint: String,
    pub sequence: Option<String>,
    pub error_sequence: Option<String>,
    pub auto_ack: bool,
    pub response_timeout: Duration,
    pub validate: bool,
}

impl ProcessorSettings {
    pub fn new<N: Into<String>>(endpoint: N, listener: &ListenerSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            sequence: None,
            error_sequence: None,
            auto_ack: listener.auto_ack,
            response_timeout: listener.response_timeout,
            validate: listener.validate,
        }
    }
}

/// What the connection should do after a frame was processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Write this frame now
    Respond(OutboundMessage),
    /// The response will arrive later through the connection link
    Pending(MessageId),
}

/// Submits decoded frames to the execution engine
pub struct MessageProcessor {
    settings: ProcessorSettings,
    engine: Arc<dyn ExecutionEngine>,
    parser: Arc<dyn MessageParser>,
    acks: Arc<dyn AckGenerator>,
    correlator: RequestCorrelator,
    pool: Arc<ExecutionPool>,
}

impl MessageProcessor {
    pub fn new(
        settings: ProcessorSettings,
        engine: Arc<dyn ExecutionEngine>,
        parser: Arc<dyn MessageParser>,
        acks: Arc<dyn AckGenerator>,
        pool: Arc<ExecutionPool>,
    ) -> Self {
        let correlator = RequestCorrelator::new(pool.handle().clone(), acks.clone());
        Self {
            settings,
            engine,
            parser,
            acks,
            correlator,
            pool,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    /// Process one decoded frame received on `link`'s connection
    pub fn process(&self, body: Vec<u8>, link: &ConnectionLink) -> ProcessOutcome {
        let connection = link.key();
        let parsed = self.parser.parse(&body, self.settings.validate);
        let message = InboundMessage::new(connection, body);
        let id = message.id;

        match (parsed, self.settings.auto_ack) {
            (Ok(header), true) => {
                let message = message.with_header(header);
                let ack = self.acks.ack(&message);
                self.submit(message, self.settings.sequence.clone(), None, None);
                ProcessOutcome::Respond(OutboundMessage::ack(ack))
            }
            (Err(failure), true) => {
                warn!(
                    endpoint = %self.settings.endpoint,
                    connection = %connection,
                    error = %failure,
                    "Rejecting invalid message"
                );
                let nack = self.acks.nack(None, &failure.to_string());
                ProcessOutcome::Respond(OutboundMessage::nack(nack))
            }
            (Ok(header), false) => {
                let message = message.with_header(header);
                let responder = self.arm(&message, link);
                self.submit(message, self.settings.sequence.clone(), Some(responder), None);
                ProcessOutcome::Pending(id)
            }
            (Err(failure), false) => {
                warn!(
                    endpoint = %self.settings.endpoint,
                    connection = %connection,
                    error = %failure,
                    "Routing invalid message to the error sequence"
                );
                let responder = self.arm(&message, link);
                self.submit(
                    message,
                    self.settings.error_sequence.clone(),
                    Some(responder),
                    Some(failure),
                );
                ProcessOutcome::Pending(id)
            }
        }
    }

    /// Drop any correlation state held for a closing connection
    pub fn release_connection(&self, connection: ConnectionKey) {
        self.correlator.release_connection(connection);
    }

    fn arm(&self, message: &InboundMessage, link: &ConnectionLink) -> Responder {
        let message_id = self
            .correlator
            .arm(message.clone(), link.clone(), self.settings.response_timeout);
        Responder {
            message_id,
            correlator: self.correlator.clone(),
        }
    }

    fn submit(
        &self,
        message: InboundMessage,
        sequence: Option<String>,
        responder: Option<Responder>,
        failure: Option<ContentError>,
    ) {
        let engine = self.engine.clone();
        let fallback = responder.clone();
        let request = ExecutionRequest {
            endpoint: self.settings.endpoint.clone(),
            sequence,
            message,
            responder,
            failure,
        };
        let message_id = request.message.id;
        let endpoint = request.endpoint.clone();

        self.pool.spawn(async move {
            if let Err(err) = engine.execute(request).await {
                error!(endpoint = %endpoint, message_id = %message_id, error = %err, "Execution failed");
                if let Some(responder) = fallback {
                    let reason = InflowError::from(err).to_string();
                    responder.complete(Response::Nack(reason));
                }
            }
        });
    }
}
