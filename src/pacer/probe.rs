//! Bandwidth probing.
//!
//! A probe cluster is a short run of packets sent at a requested rate, faster than the normal
//! pacing rate, so the bandwidth estimator can tell whether the link carries it. The pacer
//! sends a cluster as a series of bursts spaced at least `min_probe_delta` apart.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::macros::log_probe_cluster;
use crate::error::PacerError;
use crate::packet::ProbeInfo;
use crate::units::{Bitrate, DataSize};

/// Identifies a probe cluster. Chosen by whoever requests the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProbeClusterId(u64);

impl ProbeClusterId {
    /// Create an id from a number.
    pub const fn new(v: u64) -> Self {
        ProbeClusterId(v)
    }
}

impl From<u64> for ProbeClusterId {
    fn from(v: u64) -> Self {
        ProbeClusterId(v)
    }
}

impl fmt::Display for ProbeClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request for a probe cluster.
///
/// ```
/// use std::time::Duration;
/// use paced_sender::{Bitrate, ProbeClusterConfig};
///
/// let config = ProbeClusterConfig::new(1.into(), Bitrate::mbps(2))
///     .with_duration(Duration::from_millis(30))
///     .with_probe_count(6);
///
/// assert_eq!(config.target_probe_count(), 6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeClusterConfig {
    id: ProbeClusterId,
    target_rate: Bitrate,
    target_duration: Duration,
    target_probe_count: usize,
    min_probe_delta: Option<Duration>,
    at_time: Option<Instant>,
}

impl ProbeClusterConfig {
    /// New cluster probing at `target_rate`.
    ///
    /// Defaults to 15ms duration and 5 probes, which gives the estimator enough samples
    /// without holding back media for long.
    pub fn new(id: ProbeClusterId, target_rate: Bitrate) -> Self {
        ProbeClusterConfig {
            id,
            target_rate,
            target_duration: Duration::from_millis(15),
            target_probe_count: 5,
            min_probe_delta: None,
            at_time: None,
        }
    }

    /// How long the cluster should sustain the target rate.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.target_duration = duration;
        self
    }

    /// Number of probe bursts to send. The cluster ends after this many bursts, or earlier
    /// if its duration runs out.
    pub fn with_probe_count(mut self, count: usize) -> Self {
        self.target_probe_count = count;
        self
    }

    /// Minimum spacing between bursts. Defaults to the pacer's configured value.
    pub fn with_min_probe_delta(mut self, delta: Duration) -> Self {
        self.min_probe_delta = Some(delta);
        self
    }

    /// Earliest time the cluster may start. Defaults to when it is requested.
    pub fn with_at_time(mut self, at_time: Instant) -> Self {
        self.at_time = Some(at_time);
        self
    }

    /// The cluster id.
    pub fn id(&self) -> ProbeClusterId {
        self.id
    }

    /// The rate to probe at.
    pub fn target_rate(&self) -> Bitrate {
        self.target_rate
    }

    /// How long the cluster should sustain the target rate.
    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    /// Number of probe bursts.
    pub fn target_probe_count(&self) -> usize {
        self.target_probe_count
    }

    /// Bytes the cluster sends when it sustains the target rate for its duration.
    pub fn target_bytes(&self) -> DataSize {
        self.target_rate * self.target_duration
    }

    pub(crate) fn validate(&self) -> Result<(), PacerError> {
        let reason = if self.target_probe_count == 0 {
            "probe count must be at least 1"
        } else if self.target_duration.is_zero() {
            "duration must be positive"
        } else if !self.target_rate.is_valid() || self.target_rate.is_zero() {
            "target rate must be positive and finite"
        } else {
            return Ok(());
        };

        Err(PacerError::InvalidProbeCluster {
            id: self.id,
            reason,
        })
    }
}

/// Runtime state of one requested cluster.
#[derive(Debug)]
struct ProbeCluster {
    config: ProbeClusterConfig,
    at_time: Instant,
    min_probe_delta: Duration,
    sent_bytes: DataSize,
    sent_probes: usize,
    started_at: Option<Instant>,
    last_burst_at: Option<Instant>,
}

impl ProbeCluster {
    fn new(now: Instant, config: ProbeClusterConfig, default_delta: Duration) -> Self {
        ProbeCluster {
            config,
            at_time: config.at_time.unwrap_or(now),
            min_probe_delta: config.min_probe_delta.unwrap_or(default_delta),
            sent_bytes: DataSize::ZERO,
            sent_probes: 0,
            started_at: None,
            last_burst_at: None,
        }
    }

    /// When the next burst is due. `None` if that is too far off to represent.
    fn next_burst_time(&self) -> Option<Instant> {
        let (Some(started_at), Some(last_burst_at)) = (self.started_at, self.last_burst_at) else {
            return Some(self.at_time);
        };

        // Keep the average rate on target, with bursts at least min_probe_delta apart.
        let on_rate = started_at.checked_add(self.sent_bytes / self.config.target_rate)?;
        let spaced = last_burst_at.checked_add(self.min_probe_delta)?;

        Some(on_rate.max(spaced))
    }

    /// Bytes to send per burst so that one burst every `min_probe_delta` hits the target rate.
    fn burst_size(&self) -> DataSize {
        let size = self.config.target_rate * self.min_probe_delta;
        size.max(DataSize::bytes(1))
    }

    /// Done once the probe count is reached or the duration has passed, whichever is first.
    fn is_complete(&self, now: Instant) -> bool {
        let Some(started_at) = self.started_at else {
            return false;
        };

        self.sent_probes >= self.config.target_probe_count
            || now.saturating_duration_since(started_at) >= self.config.target_duration
    }

    fn probe_info(&self) -> ProbeInfo {
        ProbeInfo {
            cluster_id: self.config.id,
            target_rate: self.config.target_rate,
            target_probe_count: self.config.target_probe_count,
            target_bytes: self.config.target_bytes(),
        }
    }
}

/// Runs requested probe clusters one at a time, in the order requested.
#[derive(Debug)]
pub(crate) struct BitrateProber {
    clusters: VecDeque<ProbeCluster>,
    /// Set once a packet large enough to probe with has been enqueued.
    armed: bool,
    /// Set when a due burst could not send anything. Cleared on the next enqueue.
    failed: bool,
    min_packet_size: DataSize,
    cluster_timeout: Duration,
    default_min_probe_delta: Duration,
}

impl BitrateProber {
    pub fn new(
        min_packet_size: DataSize,
        cluster_timeout: Duration,
        default_min_probe_delta: Duration,
    ) -> Self {
        BitrateProber {
            clusters: VecDeque::new(),
            armed: false,
            failed: false,
            min_packet_size,
            cluster_timeout,
            default_min_probe_delta,
        }
    }

    pub fn create_cluster(&mut self, now: Instant, config: ProbeClusterConfig) {
        debug!(?config, "Probe cluster requested");

        let cluster = ProbeCluster::new(now, config, self.default_min_probe_delta);
        self.clusters.push_back(cluster);
    }

    pub fn on_enqueue(&mut self, size: DataSize) {
        self.failed = false;

        if !self.armed && size >= self.min_packet_size {
            trace!(%size, "Probing armed");
            self.armed = true;
        }
    }

    /// Drop clusters that never got to start.
    pub fn drop_expired(&mut self, now: Instant) {
        let timeout = self.cluster_timeout;

        self.clusters.retain(|c| {
            let keep = c.started_at.is_some()
                || c.at_time.checked_add(timeout).map(|t| now <= t).unwrap_or(true);
            if !keep {
                info!(cluster = %c.config.id, "Probe cluster timed out before it started");
            }
            keep
        });
    }

    /// The cluster currently being sent, if any.
    fn active(&self, now: Instant) -> Option<&ProbeCluster> {
        if !self.armed {
            return None;
        }
        self.clusters.front().filter(|c| c.at_time <= now)
    }

    pub fn is_probing(&self, now: Instant) -> bool {
        self.active(now).is_some()
    }

    /// Whether a burst should be sent now.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.failed {
            return false;
        }
        self.active(now)
            .and_then(|c| c.next_burst_time())
            .map(|t| t <= now)
            .unwrap_or(false)
    }

    /// When the next burst is due. `None` if nothing is waiting to probe.
    pub fn next_probe_time(&self) -> Option<Instant> {
        if !self.armed || self.failed {
            return None;
        }
        self.clusters.front().and_then(|c| c.next_burst_time())
    }

    /// Size of the next burst and the metadata for its packets.
    pub fn next_burst(&self, now: Instant) -> Option<(DataSize, ProbeInfo)> {
        let cluster = self.active(now)?;
        Some((cluster.burst_size(), cluster.probe_info()))
    }

    /// Record a burst that sent `size` bytes. Retires the cluster once it is complete.
    pub fn on_burst_sent(&mut self, now: Instant, size: DataSize) {
        if size == DataSize::ZERO {
            debug!("Probe burst sent nothing, pausing probing until the next enqueue");
            self.failed = true;
            return;
        }

        let Some(cluster) = self.clusters.front_mut() else {
            return;
        };

        if cluster.started_at.is_none() {
            debug!(cluster = %cluster.config.id, rate = %cluster.config.target_rate, "Probe cluster started");
            log_probe_cluster!(cluster.config.id, "start");
            cluster.started_at = Some(now);
        }

        cluster.sent_bytes += size;
        cluster.sent_probes += 1;
        cluster.last_burst_at = Some(now);

        if cluster.is_complete(now) {
            debug!(
                cluster = %cluster.config.id,
                probes = cluster.sent_probes,
                bytes = %cluster.sent_bytes,
                "Probe cluster complete"
            );
            log_probe_cluster!(cluster.config.id, "complete");
            self.clusters.pop_front();
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.clusters.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn prober() -> BitrateProber {
        BitrateProber::new(
            DataSize::bytes(200),
            Duration::from_secs(5),
            Duration::from_millis(2),
        )
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn validate_rejects_impossible_clusters() {
        let ok = ProbeClusterConfig::new(1.into(), Bitrate::mbps(1));
        assert!(ok.validate().is_ok());

        let no_count = ok.with_probe_count(0);
        assert!(matches!(
            no_count.validate(),
            Err(PacerError::InvalidProbeCluster { .. })
        ));

        let no_duration = ok.with_duration(Duration::ZERO);
        assert!(no_duration.validate().is_err());

        let no_rate = ProbeClusterConfig::new(2.into(), Bitrate::ZERO);
        assert!(no_rate.validate().is_err());
    }

    #[test]
    fn not_probing_until_armed() {
        let now = Instant::now();
        let mut p = prober();
        p.create_cluster(now, ProbeClusterConfig::new(1.into(), Bitrate::mbps(1)));

        assert!(!p.is_probing(now));
        assert_eq!(p.next_probe_time(), None);

        p.on_enqueue(DataSize::bytes(199));
        assert!(!p.is_probing(now), "Too small to arm probing");

        p.on_enqueue(DataSize::bytes(200));
        assert!(p.is_probing(now));
        assert!(p.is_due(now));
        assert_eq!(p.next_probe_time(), Some(now));
    }

    #[test]
    fn waits_for_at_time() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));
        p.create_cluster(
            now,
            ProbeClusterConfig::new(1.into(), Bitrate::mbps(1)).with_at_time(now + ms(10)),
        );

        assert!(!p.is_probing(now));
        assert_eq!(p.next_probe_time(), Some(now + ms(10)));
        assert!(p.is_due(now + ms(10)));
    }

    #[test]
    fn burst_spacing_and_retirement() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));

        // 1 MB/s over 2ms bursts is 2000 bytes per burst, 15ms target is 15000 bytes.
        let config = ProbeClusterConfig::new(1.into(), Bitrate::bytes_per_sec(1_000_000));
        p.create_cluster(now, config);

        let (size, info) = p.next_burst(now).unwrap();
        assert_eq!(size, DataSize::bytes(2000));
        assert_eq!(info.cluster_id, 1.into());
        assert_eq!(info.target_bytes, DataSize::bytes(15_000));

        p.on_burst_sent(now, size);
        assert_eq!(p.next_probe_time(), Some(now + ms(2)));
        assert!(!p.is_due(now + Duration::from_micros(1999)));

        let mut t = now;
        for _ in 0..3 {
            t = p.next_probe_time().unwrap();
            p.on_burst_sent(t, DataSize::bytes(2000));
        }

        // 4 bursts after 6ms, not yet complete.
        assert_eq!(t, now + ms(6));
        assert_eq!(p.pending_count(), 1);

        t = p.next_probe_time().unwrap();
        p.on_burst_sent(t, DataSize::bytes(2000));
        assert_eq!(t, now + ms(8));
        assert_eq!(p.pending_count(), 0, "Retired on the fifth burst");
        assert!(!p.is_probing(t));
    }

    #[test]
    fn retires_on_duration() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));

        let config = ProbeClusterConfig::new(1.into(), Bitrate::bytes_per_sec(1_000_000))
            .with_probe_count(100)
            .with_duration(ms(10));
        p.create_cluster(now, config);

        let mut t = now;
        for _ in 0..5 {
            t = p.next_probe_time().unwrap();
            p.on_burst_sent(t, DataSize::bytes(2000));
        }
        assert_eq!(t, now + ms(8));
        assert_eq!(p.pending_count(), 1);

        // Far short of the probe count, but the duration is up.
        t = p.next_probe_time().unwrap();
        p.on_burst_sent(t, DataSize::bytes(2000));
        assert_eq!(t, now + ms(10));
        assert_eq!(p.pending_count(), 0);
        assert!(!p.is_probing(t));
    }

    #[test]
    fn retires_on_count_before_duration() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));

        let config = ProbeClusterConfig::new(1.into(), Bitrate::bytes_per_sec(1_000_000))
            .with_probe_count(2)
            .with_duration(Duration::from_secs(1));
        p.create_cluster(now, config);

        // Small bursts, nowhere near the bytes for a second at this rate.
        p.on_burst_sent(now, DataSize::bytes(100));
        assert_eq!(p.pending_count(), 1);
        p.on_burst_sent(now + ms(2), DataSize::bytes(100));
        assert_eq!(p.pending_count(), 0);
    }

    #[test]
    fn next_burst_follows_rate_for_large_bursts() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));
        p.create_cluster(
            now,
            ProbeClusterConfig::new(1.into(), Bitrate::bytes_per_sec(1_000_000)),
        );

        // A 5000 byte burst takes 5ms at the target rate, longer than the 2ms spacing.
        p.on_burst_sent(now, DataSize::bytes(5000));
        assert_eq!(p.next_probe_time(), Some(now + ms(5)));
    }

    #[test]
    fn clusters_run_in_request_order() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));

        let first = ProbeClusterConfig::new(1.into(), Bitrate::bytes_per_sec(100_000))
            .with_probe_count(1)
            .with_duration(ms(1));
        let second = ProbeClusterConfig::new(2.into(), Bitrate::bytes_per_sec(100_000));
        p.create_cluster(now, first);
        p.create_cluster(now, second);

        assert_eq!(p.next_burst(now).unwrap().1.cluster_id, 1.into());
        p.on_burst_sent(now, DataSize::bytes(200));
        assert_eq!(p.next_burst(now).unwrap().1.cluster_id, 2.into());
    }

    #[test]
    fn failed_burst_pauses_until_enqueue() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));
        p.create_cluster(now, ProbeClusterConfig::new(1.into(), Bitrate::mbps(1)));

        p.on_burst_sent(now, DataSize::ZERO);
        assert!(!p.is_due(now));
        assert_eq!(p.next_probe_time(), None);
        assert!(p.is_probing(now));

        p.on_enqueue(DataSize::bytes(10));
        assert!(p.is_due(now));
    }

    #[test]
    fn unrepresentable_burst_time_is_never_due() {
        let now = Instant::now();
        let mut p = prober();
        p.on_enqueue(DataSize::bytes(1000));

        let config = ProbeClusterConfig::new(1.into(), Bitrate::from(1e-18)).with_probe_count(10);
        assert!(config.validate().is_ok());
        p.create_cluster(now, config);

        let (size, _) = p.next_burst(now).unwrap();
        assert_eq!(size, DataSize::bytes(1));
        p.on_burst_sent(now, DataSize::bytes(1000));

        // A thousand bytes at that rate is beyond any instant.
        assert_eq!(p.next_probe_time(), None);
        assert!(!p.is_due(now + Duration::from_secs(3600)));
        assert!(p.is_probing(now));
    }

    #[test]
    fn huge_timeout_never_expires() {
        let now = Instant::now();
        let mut p = BitrateProber::new(DataSize::bytes(200), Duration::MAX, ms(2));
        p.create_cluster(now, ProbeClusterConfig::new(1.into(), Bitrate::mbps(1)));

        p.drop_expired(now + Duration::from_secs(3600));
        assert_eq!(p.pending_count(), 1);
    }

    #[test]
    fn unstarted_clusters_time_out() {
        let now = Instant::now();
        let mut p = prober();
        p.create_cluster(now, ProbeClusterConfig::new(1.into(), Bitrate::mbps(1)));

        p.drop_expired(now + Duration::from_secs(5));
        assert_eq!(p.pending_count(), 1);

        p.drop_expired(now + Duration::from_secs(5) + ms(1));
        assert_eq!(p.pending_count(), 0);
    }
}
