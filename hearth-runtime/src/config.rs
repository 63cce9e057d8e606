//! Server and service configuration
//!
//! Configuration is plain code: builder-style structs with defaults. Nothing
//! here is read from files.

use hearth_core::id::ServiceId;
use hearth_core::options::ConnectionOptions;
use std::time::Duration;

/// Interval of the per-worker idle-connection scan.
pub const DEFAULT_SOCKET_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Dispatches slower than this are logged as warnings.
pub const DEFAULT_SLOW_DISPATCH: Duration = Duration::from_millis(100);

/// Longest a worker sleeps without a wake-up or timer.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Server options.
///
/// # Examples
///
/// ```
/// use hearth_runtime::config::ServerOptions;
///
/// let opts = ServerOptions::default().with_worker_count(2).with_name("gate");
/// assert_eq!(opts.worker_count, 2);
/// ```
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Worker threads (1..=255). Defaults to the number of CPUs.
    pub worker_count: usize,
    pub name: String,
    pub socket_scan_interval: Duration,
    pub slow_dispatch: Duration,
    pub idle_wait: Duration,
    /// Defaults for every new connection.
    pub connection: ConnectionOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().clamp(1, u8::MAX as usize),
            name: String::from("hearth"),
            socket_scan_interval: DEFAULT_SOCKET_SCAN_INTERVAL,
            slow_dispatch: DEFAULT_SLOW_DISPATCH,
            idle_wait: DEFAULT_IDLE_WAIT,
            connection: ConnectionOptions::default(),
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.clamp(1, u8::MAX as usize);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_socket_scan_interval(mut self, interval: Duration) -> Self {
        self.socket_scan_interval = interval;
        self
    }

    pub fn with_slow_dispatch(mut self, threshold: Duration) -> Self {
        self.slow_dispatch = threshold;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionOptions) -> Self {
        self.connection = connection;
        self
    }
}

/// Request to create one service.
///
/// `creator` and `session` are filled in by `ServiceContext::new_service`
/// when the creator waits for the new id.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Registered factory name.
    pub service_type: String,
    pub name: String,
    /// Register `name` in the unique-service table and receive SYSTEM
    /// broadcasts.
    pub unique: bool,
    /// Pin to this worker (1-based).
    pub worker: Option<u8>,
    pub creator: ServiceId,
    pub session: i32,
    /// Advisory memory budget in bytes (0 = unlimited).
    pub memory_limit: usize,
    /// Script or module the service should load, if any.
    pub source: String,
    /// Free-form parameters.
    pub params: String,
}

impl ServiceConfig {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn pinned_to(mut self, worker: u8) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }
}
