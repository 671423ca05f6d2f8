use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use super::budget::{Budget, BudgetKind};
use super::probe::{BitrateProber, ProbeClusterConfig};
use super::queue::PacketQueue;
use super::{PacerReason, PacketSender};
use crate::config::PacerConfig;
use crate::error::PacerError;
use crate::packet::{Packet, PacketKind, ProbeInfo, StreamId};
use crate::units::{Bitrate, DataSize};
use crate::util::{MovingAverage, Soonest};

/// Cap for the rate used when draining a large queue.
const MAX_BITRATE: Bitrate = Bitrate::gbps(10);
/// Shortest time a large queue is given to drain.
const MIN_DRAIN_TIME: Duration = Duration::from_millis(1);
/// Padding is requested in chunks covering this much time at the padding rate.
const PADDING_BURST_INTERVAL: Duration = Duration::from_millis(5);
const PACKET_SIZE_SMOOTHING: f64 = 0.05;

/// The pacing decision core.
///
/// Holds the queued packets, the media and padding budgets and the probe clusters. Every
/// operation takes the current time, nothing in here reads a clock. Drive it by calling
/// [`PacingController::process`] whenever [`PacingController::poll_timeout`] says so, and after
/// any other operation.
///
/// ```
/// use std::time::Instant;
/// use paced_sender::{Bitrate, DataSize, Packet, PacketKind, PacketSender};
/// use paced_sender::{PacerConfig, PacingController, ProbeInfo, SendError};
///
/// struct Sender(usize);
///
/// impl PacketSender for Sender {
///     fn send_packet(&mut self, _: Packet, _: Option<ProbeInfo>) -> Result<(), SendError> {
///         self.0 += 1;
///         Ok(())
///     }
///
///     fn generate_padding(&mut self, _: DataSize) -> Vec<Packet> {
///         vec![]
///     }
/// }
///
/// let now = Instant::now();
/// let config = PacerConfig::new().set_initial_rates(Bitrate::mbps(1), Bitrate::ZERO);
/// let mut pacer = PacingController::new(config).unwrap();
/// let mut sender = Sender(0);
///
/// pacer.start(now);
/// pacer.enqueue_packets(now, [Packet::new(PacketKind::Video, 1, 1200)]);
///
/// while let (Some(at), _) = pacer.poll_timeout() {
///     if at > now {
///         break;
///     }
///     pacer.process(now, &mut sender);
/// }
///
/// assert_eq!(sender.0, 1);
/// ```
#[derive(Debug)]
pub struct PacingController {
    config: PacerConfig,
    queue: PacketQueue,
    media_budget: Budget,
    padding_budget: Budget,
    prober: BitrateProber,
    /// Configured media rate. The media budget runs faster when draining a large queue.
    media_rate: Bitrate,
    padding_rate: Bitrate,
    started_at: Option<Instant>,
    /// Last time the budgets were brought up to date. Only set once started.
    last_update: Option<Instant>,
    /// Latest time seen in any call. Time never goes backwards.
    last_now: Option<Instant>,
    first_sent_at: Option<Instant>,
    /// Paced sends are held back until this time.
    hold_until: Option<Instant>,
    /// Set when the padding producer came back empty.
    padding_backoff_until: Option<Instant>,
    packet_size: MovingAverage,
    packets_sent: u64,
    bytes_sent: DataSize,
    send_failures: u64,
}

/// Point in time snapshot of the pacer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacerStats {
    /// Bytes waiting in the queue.
    pub queue_size: DataSize,
    /// Packets waiting in the queue.
    pub queue_packet_count: usize,
    /// How long the oldest queued packet has waited. Zero if the queue is empty.
    pub oldest_packet_wait_time: Duration,
    /// Time to drain the queue at the configured media rate.
    pub expected_queue_time: Duration,
    /// Average time the queued packets have waited.
    pub average_queue_time: Duration,
    /// The first successful send, ever.
    pub first_sent_packet_time: Option<Instant>,
    /// Whether a probe cluster is being sent.
    pub is_probing: bool,
    /// Configured media rate.
    pub media_rate: Bitrate,
    /// Configured padding rate.
    pub padding_rate: Bitrate,
    /// Packets successfully handed to the sender.
    pub packets_sent: u64,
    /// Bytes successfully handed to the sender.
    pub bytes_sent: DataSize,
    /// Packets the sender failed to send.
    pub send_failures: u64,
    per_kind: [usize; 5],
}

impl PacerStats {
    /// Number of queued packets of the given kind.
    pub fn queued(&self, kind: PacketKind) -> usize {
        self.per_kind[kind.priority()]
    }
}

impl PacingController {
    /// Create a controller. Nothing is sent until [`PacingController::start`].
    pub fn new(config: PacerConfig) -> Result<Self, PacerError> {
        config.validate()?;

        let media_rate = config.initial_media_rate;
        let padding_rate = config.initial_padding_rate.min(media_rate);

        let prober = BitrateProber::new(
            config.min_packet_size_to_probe,
            config.probe_cluster_timeout,
            config.min_probe_delta,
        );

        debug!(?config, "Create pacing controller");

        Ok(PacingController {
            media_budget: Budget::new(BudgetKind::Media, media_rate, config.burst_interval),
            padding_budget: Budget::new(BudgetKind::Padding, padding_rate, config.burst_interval),
            config,
            queue: PacketQueue::default(),
            prober,
            media_rate,
            padding_rate,
            started_at: None,
            last_update: None,
            last_now: None,
            first_sent_at: None,
            hold_until: None,
            padding_backoff_until: None,
            packet_size: MovingAverage::new(PACKET_SIZE_SMOOTHING),
            packets_sent: 0,
            bytes_sent: DataSize::ZERO,
            send_failures: 0,
        })
    }

    /// Start sending. Budgets open with their full burst credit.
    pub fn start(&mut self, now: Instant) {
        let now = self.advance(now);

        if self.started_at.is_some() {
            return;
        }

        info!("Pacer started");
        self.started_at = Some(now);
        self.last_update = Some(now);
        self.update_drain_rate(now);
        self.media_budget.fill();
        self.padding_budget.fill();
    }

    /// Whether [`PacingController::start`] has been called.
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Set the media and padding rates.
    ///
    /// The padding rate is capped to the media rate. Queued packets are kept, only the pace of
    /// future sends changes. A zero media rate stops everything but audio.
    pub fn set_rates(
        &mut self,
        now: Instant,
        media_rate: Bitrate,
        padding_rate: Bitrate,
    ) -> Result<(), PacerError> {
        for rate in [media_rate, padding_rate] {
            if !rate.is_valid() {
                return Err(PacerError::InvalidRate { rate });
            }
        }

        let now = self.advance(now);
        self.update_budgets(now);

        let padding_rate = if padding_rate > media_rate {
            debug!(%padding_rate, %media_rate, "Padding rate capped to media rate");
            media_rate
        } else {
            padding_rate
        };

        if media_rate != self.media_rate || padding_rate != self.padding_rate {
            debug!(%media_rate, %padding_rate, "Set rates");
        }

        self.media_rate = media_rate;
        self.padding_rate = padding_rate;
        self.padding_budget.set_rate(padding_rate);
        self.update_drain_rate(now);

        Ok(())
    }

    /// Change how far ahead of real time the budgets may run.
    pub fn set_burst_interval(&mut self, now: Instant, burst_interval: Duration) {
        let now = self.advance(now);
        self.update_budgets(now);

        debug!(?burst_interval, "Set burst interval");
        self.config.burst_interval = burst_interval;
        self.media_budget.set_burst_interval(burst_interval);
        self.padding_budget.set_burst_interval(burst_interval);
    }

    /// Change the limit for how long the average packet may wait. `None` disables draining.
    pub fn set_queue_time_limit(&mut self, now: Instant, limit: Option<Duration>) {
        let now = self.advance(now);
        self.update_budgets(now);

        self.config.queue_time_limit = limit;
        self.update_drain_rate(now);
    }

    /// Add packets to the queue.
    pub fn enqueue_packets(&mut self, now: Instant, packets: impl IntoIterator<Item = Packet>) {
        let now = self.advance(now);

        // Idle time until now must not count as backlog.
        if self.queue.is_empty() {
            self.update_budgets(now);
        }

        for packet in packets {
            self.prober.on_enqueue(packet.size);
            self.queue.push(now, packet);
        }

        self.update_drain_rate(now);
    }

    /// Drop all queued packets of a stream. Returns the number of bytes dropped.
    pub fn remove_packets_for_stream(&mut self, now: Instant, stream_id: StreamId) -> DataSize {
        let now = self.advance(now);
        self.update_budgets(now);

        let removed = self.queue.remove_for_stream(now, stream_id);
        if removed > DataSize::ZERO {
            debug!(stream = %stream_id, %removed, "Removed queued packets for stream");
        }

        self.update_drain_rate(now);

        removed
    }

    /// Request probe clusters. Either all are accepted, or none.
    pub fn create_probe_clusters(
        &mut self,
        now: Instant,
        configs: impl IntoIterator<Item = ProbeClusterConfig>,
    ) -> Result<(), PacerError> {
        let configs: Vec<_> = configs.into_iter().collect();

        for config in &configs {
            config.validate()?;
        }

        let now = self.advance(now);
        for config in configs {
            self.prober.create_cluster(now, config);
        }

        Ok(())
    }

    /// Send whatever is due at `now`.
    pub fn process<S>(&mut self, now: Instant, sender: &mut S)
    where
        S: PacketSender + ?Sized,
    {
        let now = self.advance(now);

        if self.started_at.is_none() {
            return;
        }

        self.update_budgets(now);

        let mut sent_paced = false;

        loop {
            // Audio is never held back.
            let next_is_unpaced = self.queue.peek().map(|p| p.kind.is_unpaced());
            if next_is_unpaced == Some(true) {
                let Some(packet) = self.queue.pop(now) else {
                    break;
                };
                self.send(now, packet, None, sender);
                continue;
            }

            // Probes are never held back either.
            if self.prober.is_due(now) {
                self.send_probe_burst(now, sender);
                continue;
            }

            if self.is_held_back(now) {
                break;
            }

            if self.queue.is_empty() && !self.enqueue_padding(now, sender) {
                break;
            }

            if !self.media_budget.can_send() {
                break;
            }

            let Some(packet) = self.queue.pop(now) else {
                break;
            };

            self.packet_size.update(packet.size.as_bytes_f64());
            self.send(now, packet, None, sender);
            sent_paced = true;
        }

        if sent_paced {
            self.hold_until = Some(now + self.hold_back());
        }
    }

    /// When [`PacingController::process`] should next be called, and why.
    ///
    /// `None` means nothing will happen until the next operation on the controller.
    pub fn poll_timeout(&self) -> (Option<Instant>, PacerReason) {
        let (Some(last_update), Some(now)) = (self.last_update, self.last_now) else {
            return (None, PacerReason::Idle);
        };

        if self.queue.has_unpaced() {
            return (Some(now), PacerReason::Unpaced);
        }

        let probe = (self.prober.next_probe_time(), PacerReason::Probe);

        let paced = if self.queue.is_empty() {
            self.next_padding_time(last_update)
        } else {
            self.next_paced_time(last_update)
        };

        probe.soonest(paced)
    }

    /// How long the oldest queued packet has waited.
    pub fn oldest_packet_wait_time(&self, now: Instant) -> Duration {
        self.queue
            .oldest_enqueue_time()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    /// Bytes waiting in the queue.
    pub fn queue_size(&self) -> DataSize {
        self.queue.size()
    }

    /// Packets waiting in the queue.
    pub fn queue_packet_count(&self) -> usize {
        self.queue.packet_count()
    }

    /// Time to drain the queue at the configured media rate.
    pub fn expected_queue_time(&self) -> Duration {
        if self.media_rate.is_zero() || self.queue.is_empty() {
            return Duration::ZERO;
        }
        self.queue.size() / self.media_rate
    }

    /// Average time the queued packets have waited.
    pub fn average_queue_time(&self, now: Instant) -> Duration {
        self.queue.average_queue_time(now)
    }

    /// The first successful send, ever.
    pub fn first_sent_packet_time(&self) -> Option<Instant> {
        self.first_sent_at
    }

    /// Whether a probe cluster is being sent.
    pub fn is_probing(&self, now: Instant) -> bool {
        self.prober.is_probing(now)
    }

    /// The configured media rate.
    pub fn media_rate(&self) -> Bitrate {
        self.media_rate
    }

    /// The configured padding rate.
    pub fn padding_rate(&self) -> Bitrate {
        self.padding_rate
    }

    /// Snapshot of the pacer state.
    pub fn stats(&self, now: Instant) -> PacerStats {
        let mut per_kind = [0; 5];
        for kind in PacketKind::ALL {
            per_kind[kind.priority()] = self.queue.count_of(kind);
        }

        PacerStats {
            queue_size: self.queue_size(),
            queue_packet_count: self.queue_packet_count(),
            oldest_packet_wait_time: self.oldest_packet_wait_time(now),
            expected_queue_time: self.expected_queue_time(),
            average_queue_time: self.average_queue_time(now),
            first_sent_packet_time: self.first_sent_at,
            is_probing: self.is_probing(now),
            media_rate: self.media_rate,
            padding_rate: self.padding_rate,
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            send_failures: self.send_failures,
            per_kind,
        }
    }

    fn advance(&mut self, now: Instant) -> Instant {
        let now = match self.last_now {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_now = Some(now);
        now
    }

    fn update_budgets(&mut self, now: Instant) {
        let Some(last_update) = self.last_update else {
            return;
        };

        let elapsed = now.saturating_duration_since(last_update);
        let backlogged = !self.queue.is_empty();

        self.media_budget.accrue(elapsed, backlogged);
        self.padding_budget.accrue(elapsed, backlogged);
        self.last_update = Some(now);

        self.prober.drop_expired(now);
        self.update_drain_rate(now);
    }

    /// Raise the media budget's rate above the configured rate if the queue would otherwise
    /// wait longer than the queue time limit.
    fn update_drain_rate(&mut self, now: Instant) {
        let mut rate = self.media_rate;

        if let Some(limit) = self.config.queue_time_limit {
            // A zero rate is a pause, not something to drain.
            if !self.queue.is_empty() && !rate.is_zero() {
                let avg_queue_time = self.queue.average_queue_time(now);
                let target_wait = MIN_DRAIN_TIME.max(limit.saturating_sub(avg_queue_time));
                let min_rate = self.queue.size() / target_wait;

                if min_rate > rate {
                    rate = rate.max(min_rate.min(MAX_BITRATE));
                }
            }
        }

        if rate != self.media_budget.rate() {
            trace!(%rate, "Media budget rate");
            self.media_budget.set_rate(rate);
        }
    }

    fn is_held_back(&self, now: Instant) -> bool {
        self.hold_until.map(|t| now < t).unwrap_or(false)
    }

    /// Length of the holdback window. The tighter of the fixed window and the packet count
    /// based window.
    fn hold_back(&self) -> Duration {
        let fixed = self.config.coalescing_window;

        let (Some(packets), Some(avg_size)) = (self.config.packet_holdback, self.packet_size.get())
        else {
            return fixed;
        };

        let size = DataSize::bytes((avg_size * packets as f64).round() as i64);
        let by_count = size / self.media_budget.rate();

        fixed.min(by_count)
    }

    fn next_paced_time(&self, last_update: Instant) -> (Option<Instant>, PacerReason) {
        if self.media_budget.rate().is_zero() {
            return (None, PacerReason::Idle);
        }

        let Some(send_at) = last_update.checked_add(self.media_budget.time_to_clear()) else {
            return (None, PacerReason::Idle);
        };

        match self.hold_until {
            Some(hold_until) if hold_until > send_at => {
                (Some(hold_until), PacerReason::Coalescing)
            }
            _ => (Some(send_at), PacerReason::Paced),
        }
    }

    fn next_padding_time(&self, last_update: Instant) -> (Option<Instant>, PacerReason) {
        if self.first_sent_at.is_none() || self.padding_rate.is_zero() {
            return (None, PacerReason::Idle);
        }

        let clear = self
            .media_budget
            .time_to_clear()
            .max(self.padding_budget.time_to_clear());

        let Some(mut at) = last_update.checked_add(clear) else {
            return (None, PacerReason::Idle);
        };

        for t in [self.padding_backoff_until, self.hold_until].into_iter().flatten() {
            at = at.max(t);
        }

        (Some(at), PacerReason::Padding)
    }

    /// Ask the sender for padding if the budgets allow it. Returns true if any was enqueued.
    fn enqueue_padding<S>(&mut self, now: Instant, sender: &mut S) -> bool
    where
        S: PacketSender + ?Sized,
    {
        if self.first_sent_at.is_none() || self.padding_rate.is_zero() {
            return false;
        }

        if !self.media_budget.can_send() || !self.padding_budget.can_send() {
            return false;
        }

        if self.padding_backoff_until.map(|t| now < t).unwrap_or(false) {
            return false;
        }

        let target = (self.padding_rate * PADDING_BURST_INTERVAL).max(DataSize::bytes(1));

        let enqueued = self.enqueue_generated_padding(now, target, sender);

        if enqueued == DataSize::ZERO {
            trace!(%target, "No padding available");
            self.padding_backoff_until = Some(now + PADDING_BURST_INTERVAL);
            return false;
        }

        self.padding_backoff_until = None;
        true
    }

    fn enqueue_generated_padding<S>(&mut self, now: Instant, target: DataSize, sender: &mut S) -> DataSize
    where
        S: PacketSender + ?Sized,
    {
        let padding = guarded("generate_padding", sender, |s| s.generate_padding(target))
            .unwrap_or_default();

        let mut total = DataSize::ZERO;
        for mut packet in padding {
            packet.kind = PacketKind::Padding;
            total += packet.size;
            self.queue.push(now, packet);
        }

        total
    }

    /// Send one probe burst, taking queued packets first and topping up with padding.
    fn send_probe_burst<S>(&mut self, now: Instant, sender: &mut S)
    where
        S: PacketSender + ?Sized,
    {
        let Some((burst_size, info)) = self.prober.next_burst(now) else {
            return;
        };

        let mut sent = DataSize::ZERO;

        while sent < burst_size {
            if self.queue.is_empty() {
                let generated = self.enqueue_generated_padding(now, burst_size - sent, sender);
                if generated == DataSize::ZERO {
                    break;
                }
            }

            let Some(packet) = self.queue.pop(now) else {
                break;
            };

            sent += packet.size;
            self.send(now, packet, Some(info), sender);
        }

        self.prober.on_burst_sent(now, sent);
    }

    fn send<S>(&mut self, now: Instant, packet: Packet, probe: Option<ProbeInfo>, sender: &mut S)
    where
        S: PacketSender + ?Sized,
    {
        let kind = packet.kind;
        let stream_id = packet.stream_id;
        let size = packet.size;

        // Budget is spent on the decision to send, whatever the outcome.
        self.media_budget.consume(size);
        self.padding_budget.consume(size);

        trace!(%kind, stream = %stream_id, %size, probe = ?probe.map(|p| p.cluster_id), "Send packet");

        match guarded("send_packet", sender, |s| s.send_packet(packet, probe)) {
            Some(Ok(())) => {
                if self.first_sent_at.is_none() {
                    debug!("First packet sent");
                    self.first_sent_at = Some(now);
                }
                self.packets_sent += 1;
                self.bytes_sent += size;
            }
            Some(Err(e)) => {
                warn!(%kind, stream = %stream_id, "Failed to send packet: {}", e);
                self.send_failures += 1;
            }
            None => {
                self.send_failures += 1;
            }
        }

        if kind == PacketKind::Video {
            let redundancy =
                guarded("fetch_redundancy", sender, |s| s.fetch_redundancy()).unwrap_or_default();

            for packet in redundancy {
                self.queue.push(now, packet);
            }
        }
    }
}

/// Call into the sender, turning a panic into `None`.
fn guarded<S, T>(what: &str, sender: &mut S, f: impl FnOnce(&mut S) -> T) -> Option<T>
where
    S: PacketSender + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(sender))) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Packet sender panicked in {}", what);
            None
        }
    }
}
