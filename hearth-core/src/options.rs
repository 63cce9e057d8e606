//! Connection configuration options
//!
//! Per-connection settings applied by the socket bridge. Every connection
//! starts from the server-wide defaults and can be adjusted at runtime
//! (`set_timeout`, `set_send_queue_limit`, `set_enable_chunked`).

use std::time::Duration;

/// Which directions use slice framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkedMode {
    pub read: bool,
    pub write: bool,
}

impl ChunkedMode {
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };

    /// Parse `"r"`, `"w"`, `"rw"` (any order, case-insensitive). Unknown
    /// characters yield `None`.
    #[must_use]
    pub fn parse(flags: &str) -> Option<Self> {
        let mut mode = Self::NONE;
        for c in flags.chars() {
            match c.to_ascii_lowercase() {
                'r' => mode.read = true,
                'w' => mode.write = true,
                _ => return None,
            }
        }
        Some(mode)
    }
}

/// Connection options.
///
/// # Examples
///
/// ```
/// use hearth_core::options::ConnectionOptions;
/// use std::time::Duration;
///
/// let opts = ConnectionOptions::default()
///     .with_read_timeout(Duration::from_secs(30))
///     .with_send_queue_limit(64, 1024);
/// assert_eq!(opts.send_queue_warn, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Idle read timeout
    ///
    /// A connection that has received nothing for this long is failed with
    /// a read-timeout error by the periodic socket scan.
    /// - `None`: never time out (default)
    pub read_timeout: Option<Duration>,

    /// Send queue length that triggers a warning (0 disables).
    pub send_queue_warn: usize,

    /// Send queue length that fails the connection (0 disables).
    pub send_queue_error: usize,

    /// Largest message a delimiter read may buffer before failing with
    /// read-message-too-big.
    pub max_read_size: usize,

    /// Bytes requested from the kernel per receive.
    pub read_buffer_size: usize,

    /// Maximum slice length for chunked framing.
    pub slice_size: usize,

    pub chunked: ChunkedMode,

    /// Disable Nagle on new connections.
    pub nodelay: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            send_queue_warn: 0,
            send_queue_error: 0,
            max_read_size: 8 * 1024 * 1024,
            read_buffer_size: 8192, // 8KB - balanced default
            slice_size: 0x7FFF,
            chunked: ChunkedMode::NONE,
            nodelay: false,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle read timeout. `Duration::ZERO` disables it.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_send_queue_limit(mut self, warn: usize, error: usize) -> Self {
        self.send_queue_warn = warn;
        self.send_queue_error = error;
        self
    }

    pub fn with_max_read_size(mut self, size: usize) -> Self {
        self.max_read_size = size;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_slice_size(mut self, size: usize) -> Self {
        self.slice_size = size.max(1);
        self
    }

    pub fn with_chunked(mut self, mode: ChunkedMode) -> Self {
        self.chunked = mode;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}
