//! Centralized Configuration Management
//!
//! Every structure here deserializes from TOML and carries sensible defaults,
//! so a host can supply only the values it cares about. `IngressConfig` is the
//! root document consumed by the runtime builder.

use crate::errors::{InflowError, InflowResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Response timeout applied when an endpoint does not configure a usable one
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 10_000;

/// Polling interval applied when an endpoint does not configure a usable one
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Socket Configuration
// ----------------------------------------------------------------------------

/// Options applied to listening and accepted sockets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Enable TCP keep-alive on accepted connections
    pub keep_alive: bool,
    /// Disable Nagle's algorithm on accepted connections
    pub no_delay: bool,
    /// Kernel receive buffer size, left to the OS when unset
    pub recv_buffer_size: Option<u32>,
    /// Kernel send buffer size, left to the OS when unset
    pub send_buffer_size: Option<u32>,
    /// Listen backlog
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            no_delay: true,
            recv_buffer_size: None,
            send_buffer_size: None,
            backlog: 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Reactor Configuration
// ----------------------------------------------------------------------------

/// Configuration for the shared protocol reactor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Number of I/O threads driving the event loop
    pub io_threads: usize,
    /// Address listeners bind to
    pub bind_address: String,
    /// Size of each pooled read/write buffer
    pub read_buffer_size: usize,
    /// Maximum number of idle buffers retained by the pool
    pub buffer_pool_capacity: usize,
    /// Close connections idle for this long
    pub idle_timeout_ms: Option<u64>,
    /// Largest accepted message body
    pub max_frame_size: usize,
    pub socket: SocketOptions,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            io_threads: 2,
            bind_address: "0.0.0.0".to_string(),
            read_buffer_size: 8 * 1024,
            buffer_pool_capacity: 1024,
            idle_timeout_ms: None,
            max_frame_size: 16 * 1024 * 1024,
            socket: SocketOptions::default(),
        }
    }
}

impl ReactorConfig {
    /// Loopback-only configuration with small buffers for tests
    pub fn testing() -> Self {
        Self {
            io_threads: 2,
            bind_address: "127.0.0.1".to_string(),
            read_buffer_size: 64,
            buffer_pool_capacity: 16,
            idle_timeout_ms: None,
            max_frame_size: 64 * 1024,
            socket: SocketOptions::default(),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

// ----------------------------------------------------------------------------
// Execution and Scheduler Configuration
// ----------------------------------------------------------------------------

/// Configuration for the pool running engine submissions and response timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub worker_threads: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

/// Configuration for coordinated job scheduling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of job cycles executing at once
    pub pool_size: usize,
    /// Coordinated intervals below this are clamped up
    pub coordinated_interval_floor_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            coordinated_interval_floor_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn testing() -> Self {
        Self {
            pool_size: 2,
            coordinated_interval_floor_ms: 50,
        }
    }

    pub fn interval_floor(&self) -> Duration {
        Duration::from_millis(self.coordinated_interval_floor_ms)
    }
}

// ----------------------------------------------------------------------------
// Endpoint Configuration
// ----------------------------------------------------------------------------

/// How an endpoint receives messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointKind {
    /// Repeated poll/consume cycle
    Polling {
        #[serde(default = "default_poll_interval")]
        interval_ms: u64,
        /// Run the task once per trigger instead of on a fixed interval
        #[serde(default)]
        one_shot: bool,
        /// Delay before a failed one-shot task is re-armed
        #[serde(default = "default_retry_delay")]
        retry_delay_ms: u64,
    },
    /// Framed TCP listener served by the protocol reactor
    Listening {
        port: u16,
        #[serde(default)]
        auto_ack: Option<bool>,
        #[serde(default)]
        response_timeout_ms: Option<u64>,
        #[serde(default)]
        validate: Option<bool>,
    },
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_retry_delay() -> u64 {
    1_000
}

/// Identity and behaviour of one inbound endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// Sequence receiving successfully decoded messages
    #[serde(default)]
    pub sequence: Option<String>,
    /// Sequence receiving messages that failed content validation
    #[serde(default)]
    pub error_sequence: Option<String>,
    #[serde(default)]
    pub paused_at_start: bool,
    /// Run through the coordinated scheduler instead of a local thread
    #[serde(default)]
    pub coordination: bool,
    pub kind: EndpointKind,
}

/// Listener settings after normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub port: u16,
    pub auto_ack: bool,
    pub response_timeout: Duration,
    pub validate: bool,
}

impl EndpointConfig {
    /// Polling endpoint with the given interval
    pub fn polling<N: Into<String>>(name: N, interval_ms: u64) -> Self {
        Self {
            name: name.into(),
            sequence: None,
            error_sequence: None,
            paused_at_start: false,
            coordination: false,
            kind: EndpointKind::Polling {
                interval_ms,
                one_shot: false,
                retry_delay_ms: default_retry_delay(),
            },
        }
    }

    /// Listening endpoint on `port` with auto-acknowledgement enabled
    pub fn listening<N: Into<String>>(name: N, port: u16) -> Self {
        Self {
            name: name.into(),
            sequence: None,
            error_sequence: None,
            paused_at_start: false,
            coordination: false,
            kind: EndpointKind::Listening {
                port,
                auto_ack: Some(true),
                response_timeout_ms: Some(DEFAULT_RESPONSE_TIMEOUT_MS),
                validate: Some(true),
            },
        }
    }

    pub fn with_sequence<S: Into<String>>(mut self, sequence: S) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    pub fn with_error_sequence<S: Into<String>>(mut self, sequence: S) -> Self {
        self.error_sequence = Some(sequence.into());
        self
    }

    pub fn with_coordination(mut self, coordination: bool) -> Self {
        self.coordination = coordination;
        self
    }

    pub fn with_paused_at_start(mut self, paused: bool) -> Self {
        self.paused_at_start = paused;
        self
    }

    pub fn with_one_shot(mut self, one_shot_enabled: bool) -> Self {
        if let EndpointKind::Polling { one_shot, .. } = &mut self.kind {
            *one_shot = one_shot_enabled;
        }
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        if let EndpointKind::Polling { retry_delay_ms, .. } = &mut self.kind {
            *retry_delay_ms = delay_ms;
        }
        self
    }

    pub fn with_auto_ack(mut self, enabled: bool) -> Self {
        if let EndpointKind::Listening { auto_ack, .. } = &mut self.kind {
            *auto_ack = Some(enabled);
        }
        self
    }

    pub fn with_response_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let EndpointKind::Listening {
            response_timeout_ms,
            ..
        } = &mut self.kind
        {
            *response_timeout_ms = Some(timeout_ms);
        }
        self
    }

    pub fn with_validate(mut self, enabled: bool) -> Self {
        if let EndpointKind::Listening { validate, .. } = &mut self.kind {
            *validate = Some(enabled);
        }
        self
    }

    /// Fill missing or unusable parameters with defaults
    ///
    /// Each substitution is logged so operators can see which value the
    /// endpoint actually runs with.
    pub fn normalize(&mut self) {
        let name = self.name.clone();
        match &mut self.kind {
            EndpointKind::Polling { interval_ms, .. } => {
                if *interval_ms == 0 && !self.coordination {
                    warn!(
                        endpoint = %name,
                        default = DEFAULT_POLL_INTERVAL_MS,
                        "Polling interval of 0 ms is not usable, using default"
                    );
                    *interval_ms = DEFAULT_POLL_INTERVAL_MS;
                }
            }
            EndpointKind::Listening {
                auto_ack,
                response_timeout_ms,
                validate,
                ..
            } => {
                if auto_ack.is_none() {
                    warn!(endpoint = %name, "Auto-acknowledgement not configured, defaulting to true");
                    *auto_ack = Some(true);
                }
                if response_timeout_ms.is_none() {
                    warn!(
                        endpoint = %name,
                        default = DEFAULT_RESPONSE_TIMEOUT_MS,
                        "Response timeout not configured, using default"
                    );
                    *response_timeout_ms = Some(DEFAULT_RESPONSE_TIMEOUT_MS);
                }
                if validate.is_none() {
                    warn!(endpoint = %name, "Message validation not configured, defaulting to true");
                    *validate = Some(true);
                }
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.kind, EndpointKind::Listening { .. })
    }

    pub fn listening_port(&self) -> Option<u16> {
        match self.kind {
            EndpointKind::Listening { port, .. } => Some(port),
            EndpointKind::Polling { .. } => None,
        }
    }

    /// Resolved listener settings, applying defaults for unset values
    pub fn listener_settings(&self) -> Option<ListenerSettings> {
        match self.kind {
            EndpointKind::Listening {
                port,
                auto_ack,
                response_timeout_ms,
                validate,
            } => Some(ListenerSettings {
                port,
                auto_ack: auto_ack.unwrap_or(true),
                response_timeout: Duration::from_millis(
                    response_timeout_ms.unwrap_or(DEFAULT_RESPONSE_TIMEOUT_MS),
                ),
                validate: validate.unwrap_or(true),
            }),
            EndpointKind::Polling { .. } => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration document for an ingestion runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub reactor: ReactorConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    #[serde(rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
}

impl IngressConfig {
    /// Small pools and loopback binding for tests
    pub fn testing() -> Self {
        Self {
            reactor: ReactorConfig::testing(),
            execution: ExecutionConfig { worker_threads: 2 },
            scheduler: SchedulerConfig::testing(),
            endpoints: Vec::new(),
        }
    }

    /// Parse, normalize and validate a TOML document
    pub fn from_toml_str(source: &str) -> InflowResult<Self> {
        let mut config: IngressConfig = toml::from_str(source)?;
        for endpoint in &mut config.endpoints {
            endpoint.normalize();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> InflowResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Reject structurally inconsistent configurations
    pub fn validate(&self) -> InflowResult<()> {
        if self.reactor.io_threads == 0 {
            return Err(InflowError::config_error("reactor.io_threads must be at least 1"));
        }
        if self.reactor.read_buffer_size == 0 {
            return Err(InflowError::config_error(
                "reactor.read_buffer_size must be at least 1",
            ));
        }
        if self.execution.worker_threads == 0 {
            return Err(InflowError::config_error(
                "execution.worker_threads must be at least 1",
            ));
        }
        if self.scheduler.pool_size == 0 {
            return Err(InflowError::config_error("scheduler.pool_size must be at least 1"));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.trim().is_empty() {
                return Err(InflowError::config_error("endpoint name must not be empty"));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(InflowError::config_error(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
            if let Some(port) = endpoint.listening_port() {
                if !ports.insert(port) {
                    return Err(InflowError::config_error(format!(
                        "port {} is configured for more than one endpoint",
                        port
                    )));
                }
            }
        }
        Ok(())
    }
}
