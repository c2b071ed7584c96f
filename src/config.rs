//! Configuration types for every layer of the transport core.
//!
//! These types hold the concrete values that drive runtime behavior. Hosts
//! usually deserialize them from their own configuration source (all types
//! derive `serde::Deserialize`) and then call [`TransportConfig::normalize`]
//! before handing them to [`Transport::new`](crate::transport::Transport::new).
//!
//! All timeouts and intervals are expressed in milliseconds.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `reactor.task_queue_capacity` | 4096 |
//! | `reactor.tasks_per_poll` | 128 |
//! | `reactor.max_events` | 1024 |
//! | `reactor.poll_ceiling_ms` | 100 |
//! | `scheduler.local_queue_capacity` | 1024 |
//! | `scheduler.global_queue_capacity` | 8192 |
//! | `scheduler.steal_attempts` | 4 |
//! | `scheduler.enable_parking` | true |
//! | `connection.read_chunk_bytes` | 16 KiB |
//! | `connection.max_read_per_event` | 256 KiB |
//! | `connection.write_buffer_capacity` | 1 MiB |
//! | `connection.write_append_timeout_ms` | 1000 |
//! | `connection.flush_quota_bytes` | 256 KiB |
//! | `call.shard_count` | 16 |
//! | `call.default_timeout_ms` | 5000 |

use serde::Deserialize;

/// Error produced by configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field that must be non-zero was zero.
    #[error("{field} must be non-zero")]
    ZeroField {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Reactor tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Capacity of each bounded task queue (pinned and parallel).
    pub task_queue_capacity: usize,
    /// Maximum tasks drained per loop iteration, bounding latency for I/O
    /// callbacks behind a long task backlog.
    pub tasks_per_poll: usize,
    /// Size of the readiness event buffer handed to the poller.
    pub max_events: usize,
    /// Upper bound on the poll wait when no timer expires sooner.
    pub poll_ceiling_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            task_queue_capacity: 4096,
            tasks_per_poll: 128,
            max_events: 1024,
            poll_ceiling_ms: 100,
        }
    }
}

/// Fiber scheduler tuning knobs (shared by both disciplines).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads. Zero means "available parallelism".
    pub workers: usize,
    /// Capacity of each worker's bounded local/pinned queue.
    pub local_queue_capacity: usize,
    /// Capacity of the bounded global queue (non-stealing discipline only;
    /// the stealing discipline's global queue is unbounded).
    pub global_queue_capacity: usize,
    /// Failed steal attempts before an idle worker yields and then parks.
    pub steal_attempts: usize,
    /// Whether idle workers park on the notifier or spin with yields.
    pub enable_parking: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            local_queue_capacity: 1024,
            global_queue_capacity: 8192,
            steal_attempts: 4,
            enable_parking: true,
        }
    }
}

impl SchedulerConfig {
    /// Resolves the effective worker count.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            self.workers
        }
    }
}

/// Per-connection tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bytes read per `read` call on the socket.
    pub read_chunk_bytes: usize,
    /// Per-readiness-event read cap; when hit, the connection yields and
    /// stays armed for readability.
    pub max_read_per_event: usize,
    /// Write-buffer capacity, keyed by byte size rather than message count.
    pub write_buffer_capacity: usize,
    /// How long an append may block waiting for write-buffer space.
    pub write_append_timeout_ms: u64,
    /// Bytes flushed per write pass (scatter/gather quota).
    pub flush_quota_bytes: usize,
    /// Connect timeout for outbound dials.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 16 * 1024,
            max_read_per_event: 256 * 1024,
            write_buffer_capacity: 1024 * 1024,
            write_append_timeout_ms: 1000,
            flush_quota_bytes: 256 * 1024,
            connect_timeout_ms: 3000,
        }
    }
}

/// Call-correlation tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Number of independently locked shards in the call map.
    pub shard_count: usize,
    /// Timeout applied when a request does not specify one.
    pub default_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            default_timeout_ms: 5000,
        }
    }
}

/// Top-level transport configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Reactor settings, one reactor per worker thread.
    pub reactor: ReactorConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Connection settings applied to every connection.
    pub connection: ConnectionConfig,
    /// Call map and timeout settings.
    pub call: CallConfig,
}

impl TransportConfig {
    /// Clamps nonsensical values to safe minimums and validates the rest.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.reactor.task_queue_capacity == 0 {
            return Err(ConfigError::ZeroField {
                field: "reactor.task_queue_capacity",
            });
        }
        if self.call.shard_count == 0 {
            return Err(ConfigError::ZeroField {
                field: "call.shard_count",
            });
        }
        if self.connection.write_buffer_capacity == 0 {
            return Err(ConfigError::ZeroField {
                field: "connection.write_buffer_capacity",
            });
        }
        self.reactor.tasks_per_poll = self.reactor.tasks_per_poll.max(1);
        self.reactor.max_events = self.reactor.max_events.max(1);
        self.connection.read_chunk_bytes = self.connection.read_chunk_bytes.max(512);
        self.connection.flush_quota_bytes = self.connection.flush_quota_bytes.max(512);
        self.scheduler.local_queue_capacity = self.scheduler.local_queue_capacity.max(1);
        self.scheduler.global_queue_capacity = self.scheduler.global_queue_capacity.max(1);
        self.scheduler.steal_attempts = self.scheduler.steal_attempts.max(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_normalize_cleanly() {
        let mut cfg = TransportConfig::default();
        cfg.normalize().expect("defaults must validate");
        assert!(cfg.scheduler.effective_workers() >= 1);
    }

    #[test]
    fn zero_shards_rejected() {
        let mut cfg = TransportConfig::default();
        cfg.call.shard_count = 0;
        assert!(cfg.normalize().is_err());
    }

    #[test]
    fn small_values_clamped() {
        let mut cfg = TransportConfig::default();
        cfg.reactor.tasks_per_poll = 0;
        cfg.connection.read_chunk_bytes = 1;
        cfg.normalize().expect("clamped, not rejected");
        assert_eq!(cfg.reactor.tasks_per_poll, 1);
        assert_eq!(cfg.connection.read_chunk_bytes, 512);
    }
}
