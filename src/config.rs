use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PacerError;
use crate::units::{Bitrate, DataSize};

/// Customized config for creating a [`PacingController`][crate::PacingController] or
/// [`TaskQueuePacer`][crate::TaskQueuePacer].
///
/// ```
/// use std::time::Duration;
/// use paced_sender::{Bitrate, PacerConfig};
///
/// let config = PacerConfig::new()
///     .set_burst_interval(Duration::from_millis(20))
///     .set_initial_rates(Bitrate::mbps(1), Bitrate::ZERO);
///
/// assert_eq!(config.burst_interval(), Duration::from_millis(20));
/// ```
///
/// Configs implement [`Clone`] to help create multiple pacers, and serde's `Serialize` and
/// `Deserialize` so they can be part of an application's config file. Missing fields take
/// their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    pub(crate) coalescing_window: Duration,
    pub(crate) packet_holdback: Option<usize>,
    pub(crate) burst_interval: Duration,
    pub(crate) queue_time_limit: Option<Duration>,
    pub(crate) initial_media_rate: Bitrate,
    pub(crate) initial_padding_rate: Bitrate,
    pub(crate) min_probe_delta: Duration,
    pub(crate) probe_cluster_timeout: Duration,
    pub(crate) min_packet_size_to_probe: DataSize,
}

impl PacerConfig {
    /// Creates a new default config.
    pub fn new() -> Self {
        PacerConfig::default()
    }

    /// Fixed holdback for paced packets.
    ///
    /// After sending paced packets the pacer waits at least this long before sending more,
    /// which batches packets into fewer wakeups. Audio and probes are never held back.
    ///
    /// Defaults to 1ms.
    pub fn set_coalescing_window(mut self, window: Duration) -> Self {
        self.coalescing_window = window;
        self
    }

    /// The fixed holdback window.
    pub fn coalescing_window(&self) -> Duration {
        self.coalescing_window
    }

    /// Packet count based holdback.
    ///
    /// Holds back paced sends for the time it takes to send this many average sized packets
    /// at the media rate. When both this and the coalescing window are set, the shorter of
    /// the two applies.
    ///
    /// Defaults to `None`.
    pub fn set_packet_holdback(mut self, packets: Option<usize>) -> Self {
        self.packet_holdback = packets;
        self
    }

    /// The packet count holdback, if set.
    pub fn packet_holdback(&self) -> Option<usize> {
        self.packet_holdback
    }

    /// How far ahead of real time the media budget may run.
    ///
    /// An idle pacer accrues this much send credit, which it can spend in one burst.
    ///
    /// Defaults to 40ms.
    pub fn set_burst_interval(mut self, interval: Duration) -> Self {
        self.burst_interval = interval;
        self
    }

    /// The burst interval.
    pub fn burst_interval(&self) -> Duration {
        self.burst_interval
    }

    /// Limit for how long the average packet waits in the queue.
    ///
    /// When the queue grows beyond what the media rate drains in this time, the pacer sends
    /// faster than the media rate. `None` disables this.
    ///
    /// Defaults to 2 seconds.
    pub fn set_queue_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.queue_time_limit = limit;
        self
    }

    /// The queue time limit, if set.
    pub fn queue_time_limit(&self) -> Option<Duration> {
        self.queue_time_limit
    }

    /// Rates to use until the first call to `set_rates`.
    ///
    /// Defaults to zero for both, which means nothing but audio is sent until rates are set.
    pub fn set_initial_rates(mut self, media_rate: Bitrate, padding_rate: Bitrate) -> Self {
        self.initial_media_rate = media_rate;
        self.initial_padding_rate = padding_rate;
        self
    }

    /// The initial media rate.
    pub fn initial_media_rate(&self) -> Bitrate {
        self.initial_media_rate
    }

    /// The initial padding rate.
    pub fn initial_padding_rate(&self) -> Bitrate {
        self.initial_padding_rate
    }

    /// Spacing between probe bursts for clusters that don't set their own.
    ///
    /// Defaults to 2ms.
    pub fn set_min_probe_delta(mut self, delta: Duration) -> Self {
        self.min_probe_delta = delta;
        self
    }

    /// The default spacing between probe bursts.
    pub fn min_probe_delta(&self) -> Duration {
        self.min_probe_delta
    }

    /// How long a requested probe cluster may wait to start before it is dropped.
    ///
    /// Defaults to 5 seconds.
    pub fn set_probe_cluster_timeout(mut self, timeout: Duration) -> Self {
        self.probe_cluster_timeout = timeout;
        self
    }

    /// The probe cluster timeout.
    pub fn probe_cluster_timeout(&self) -> Duration {
        self.probe_cluster_timeout
    }

    /// Probing starts once a packet at least this large has been enqueued.
    ///
    /// Small packets make for poor probes. Defaults to 200 bytes.
    pub fn set_min_packet_size_to_probe(mut self, size: usize) -> Self {
        self.min_packet_size_to_probe = DataSize::from(size);
        self
    }

    /// The smallest packet that arms probing.
    pub fn min_packet_size_to_probe(&self) -> DataSize {
        self.min_packet_size_to_probe
    }

    pub(crate) fn validate(&self) -> Result<(), PacerError> {
        for rate in [self.initial_media_rate, self.initial_padding_rate] {
            if !rate.is_valid() {
                return Err(PacerError::InvalidRate { rate });
            }
        }
        Ok(())
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            coalescing_window: Duration::from_millis(1),
            packet_holdback: None,
            burst_interval: Duration::from_millis(40),
            queue_time_limit: Some(Duration::from_secs(2)),
            initial_media_rate: Bitrate::ZERO,
            initial_padding_rate: Bitrate::ZERO,
            min_probe_delta: Duration::from_millis(2),
            probe_cluster_timeout: Duration::from_secs(5),
            min_packet_size_to_probe: DataSize::bytes(200),
        }
    }
}
