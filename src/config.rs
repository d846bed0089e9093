use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Routes with more hops than this are discarded. This bounds 'count to infinity' when a
    ///  part of the mesh becomes unreachable.
    pub max_hops: u8,

    /// Interval at which link metrics are re-read and routes are re-advertised to neighbours.
    ///  `None` disables periodic refresh, leaving route updates to link registration and failure.
    pub metrics_refresh_interval: Option<Duration>,

    /// A link is removed from the routing table (and closed) after this many `forward` calls in a
    ///  row failed
    pub max_consecutive_link_failures: u32,

    pub event_channel_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            max_hops: 16,
            metrics_refresh_interval: Some(Duration::from_secs(1)),
            max_consecutive_link_failures: 3,
            event_channel_capacity: 128,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_hops == 0 {
            bail!("max_hops must be at least 1");
        }
        if self.max_consecutive_link_failures == 0 {
            bail!("max_consecutive_link_failures must be at least 1");
        }
        if self.metrics_refresh_interval == Some(Duration::ZERO) {
            bail!("metrics_refresh_interval must not be zero");
        }
        if self.event_channel_capacity == 0 {
            bail!("event_channel_capacity must not be zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// delay before the first retransmission of an unacknowledged message - configure to
    ///  roughly 2x RTT
    pub retransmit_initial_delay: Duration,
    /// growth of the retransmission delay per attempt, in eighths (16 doubles the delay)
    pub retransmit_backoff_factor_eighths: u32,
    pub retransmit_max_delay: Duration,
    /// `None` retries until the message is acknowledged or the stream closes. If set, the stream
    ///  is closed as unreachable when a message exhausts its attempts.
    pub max_retransmit_attempts: Option<u32>,

    /// This is the maximum number of *messages* (not bytes) the receiver buffers ahead of the
    ///  next expected sequence number. Messages beyond it are dropped (and, for reliable
    ///  streams, re-sent later).
    pub receive_window_size: u32,
    /// For unreliable ordered streams: how long a gap in the sequence may hold back later
    ///  messages before it is skipped
    pub reorder_timeout: Duration,

    /// how long a graceful close waits for outstanding reliable sends to be acknowledged
    pub close_linger: Duration,
    /// how long the route to the peer may be missing before the stream closes as unreachable
    pub route_loss_grace_period: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            retransmit_initial_delay: Duration::from_millis(50),
            retransmit_backoff_factor_eighths: 16,
            retransmit_max_delay: Duration::from_secs(5),
            max_retransmit_attempts: None,
            receive_window_size: 256,
            reorder_timeout: Duration::from_millis(100),
            close_linger: Duration::from_secs(2),
            route_loss_grace_period: Duration::from_secs(1),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_initial_delay.is_zero() {
            bail!("retransmit_initial_delay must not be zero");
        }
        if self.retransmit_backoff_factor_eighths < 8 {
            bail!("retransmit_backoff_factor_eighths must be at least 8, i.e. the delay must not shrink");
        }
        if self.retransmit_initial_delay > self.retransmit_max_delay {
            bail!("retransmit_initial_delay must not exceed retransmit_max_delay");
        }
        if self.max_retransmit_attempts == Some(0) {
            bail!("max_retransmit_attempts must be at least 1 if set");
        }
        if self.receive_window_size == 0 {
            bail!("receive_window_size must not be zero");
        }
        Ok(())
    }
}
