//! A pacer running on its own thread.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::PacerConfig;
use crate::error::PacerError;
use crate::packet::{Packet, StreamId};
use crate::pacer::{PacerStats, PacingController, PacketSender, ProbeClusterConfig};
use crate::units::Bitrate;

/// Source of time for the [`TaskQueuePacer`].
///
/// The instants are also used as timer deadlines, so they must follow real time.
pub trait Clock: Send + 'static {
    /// The current time.
    fn now(&self) -> Instant;
}

/// [`Clock`] reading [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

enum Op {
    Start,
    SetRates(Bitrate, Bitrate),
    SetBurstInterval(Duration),
    SetQueueTimeLimit(Option<Duration>),
    Enqueue(Vec<Packet>),
    RemoveForStream(StreamId),
    CreateProbeClusters(Vec<ProbeClusterConfig>),
}

enum Message {
    Ops(Vec<Op>),
    Flush(Sender<PacerStats>),
    Shutdown,
}

/// Paces packets from a dedicated worker thread.
///
/// Owns a [`PacingController`] and a [`PacketSender`] on a thread named `paced-sender`. All
/// operations are posted to that thread and applied one at a time in the order they arrive;
/// operations from one caller are applied in the order they were made. The sender's callbacks
/// run on the worker thread.
///
/// Invalid arguments are rejected on the calling thread, before anything is posted.
///
/// Dropping the pacer stops the thread. Packets still queued are discarded.
pub struct TaskQueuePacer {
    tx: Sender<Message>,
    stats: Arc<Mutex<PacerStats>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TaskQueuePacer {
    /// Create a pacer using the system's monotonic clock.
    pub fn new<S>(config: PacerConfig, sender: S) -> Result<Self, PacerError>
    where
        S: PacketSender + Send + 'static,
    {
        Self::with_clock(config, sender, MonotonicClock)
    }

    /// Create a pacer using the given clock.
    pub fn with_clock<S, C>(config: PacerConfig, sender: S, clock: C) -> Result<Self, PacerError>
    where
        S: PacketSender + Send + 'static,
        C: Clock,
    {
        let controller = PacingController::new(config)?;

        let (tx, rx) = unbounded();
        let stats = Arc::new(Mutex::new(PacerStats::default()));
        let stats_clone = stats.clone();

        let handle = thread::Builder::new()
            .name("paced-sender".into())
            .spawn(move || run_worker(controller, sender, clock, rx, stats_clone))?;

        Ok(TaskQueuePacer {
            tx,
            stats,
            handle: Some(handle),
        })
    }

    /// Start sending. See [`PacingController::start`].
    pub fn start(&self) -> Result<(), PacerError> {
        self.post(vec![Op::Start])
    }

    /// Set media and padding rates. See [`PacingController::set_rates`].
    pub fn set_rates(&self, media_rate: Bitrate, padding_rate: Bitrate) -> Result<(), PacerError> {
        validate_rates(media_rate, padding_rate)?;
        self.post(vec![Op::SetRates(media_rate, padding_rate)])
    }

    /// Change how far ahead of real time the budgets may run.
    pub fn set_burst_interval(&self, burst_interval: Duration) -> Result<(), PacerError> {
        self.post(vec![Op::SetBurstInterval(burst_interval)])
    }

    /// Change the queue time limit. See [`PacerConfig::set_queue_time_limit`].
    pub fn set_queue_time_limit(&self, limit: Option<Duration>) -> Result<(), PacerError> {
        self.post(vec![Op::SetQueueTimeLimit(limit)])
    }

    /// Add packets to the queue.
    pub fn enqueue_packets(&self, packets: impl IntoIterator<Item = Packet>) -> Result<(), PacerError> {
        self.post(vec![Op::Enqueue(packets.into_iter().collect())])
    }

    /// Drop all queued packets of a stream.
    pub fn remove_packets_for_stream(&self, stream_id: StreamId) -> Result<(), PacerError> {
        self.post(vec![Op::RemoveForStream(stream_id)])
    }

    /// Request probe clusters. Either all are accepted, or none.
    pub fn create_probe_clusters(
        &self,
        configs: impl IntoIterator<Item = ProbeClusterConfig>,
    ) -> Result<(), PacerError> {
        let configs: Vec<_> = configs.into_iter().collect();
        for config in &configs {
            config.validate()?;
        }
        self.post(vec![Op::CreateProbeClusters(configs)])
    }

    /// Apply several operations in one go.
    ///
    /// No operation from another caller is applied in between, and no packet is sent until all
    /// of them have been applied. If any operation is invalid, none is applied.
    ///
    /// ```no_run
    /// # use paced_sender::{TaskQueuePacer, Packet, PacketKind, StreamId, PacerError};
    /// # fn f(pacer: &TaskQueuePacer) -> Result<(), PacerError> {
    /// let stream = StreamId::new(1);
    ///
    /// pacer.batch(|b| {
    ///     b.remove_packets_for_stream(stream);
    ///     b.enqueue_packets([Packet::new(PacketKind::Video, stream, 1200)]);
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn batch(&self, f: impl FnOnce(&mut Batch)) -> Result<(), PacerError> {
        let mut batch = Batch {
            ops: vec![],
            error: None,
        };

        f(&mut batch);

        if let Some(error) = batch.error {
            return Err(error);
        }

        self.post(batch.ops)
    }

    /// The latest stats published by the worker.
    pub fn stats(&self) -> PacerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Wait for all operations posted so far to be applied, and return fresh stats.
    pub fn flush(&self) -> Result<PacerStats, PacerError> {
        let (reply_tx, reply_rx) = bounded(1);

        self.tx
            .send(Message::Flush(reply_tx))
            .map_err(|_| PacerError::Disconnected)?;

        reply_rx.recv().map_err(|_| PacerError::Disconnected)
    }

    /// Stop the worker thread and wait for it to finish.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Pacer worker thread panicked");
            }
        }
    }

    fn post(&self, ops: Vec<Op>) -> Result<(), PacerError> {
        if ops.is_empty() {
            return Ok(());
        }

        self.tx
            .send(Message::Ops(ops))
            .map_err(|_| PacerError::Disconnected)
    }
}

impl Drop for TaskQueuePacer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Operations collected by [`TaskQueuePacer::batch`].
pub struct Batch {
    ops: Vec<Op>,
    error: Option<PacerError>,
}

impl Batch {
    /// See [`TaskQueuePacer::start`].
    pub fn start(&mut self) -> &mut Self {
        self.ops.push(Op::Start);
        self
    }

    /// See [`TaskQueuePacer::set_rates`].
    pub fn set_rates(&mut self, media_rate: Bitrate, padding_rate: Bitrate) -> &mut Self {
        match validate_rates(media_rate, padding_rate) {
            Ok(()) => self.ops.push(Op::SetRates(media_rate, padding_rate)),
            Err(e) => self.fail(e),
        }
        self
    }

    /// See [`TaskQueuePacer::set_burst_interval`].
    pub fn set_burst_interval(&mut self, burst_interval: Duration) -> &mut Self {
        self.ops.push(Op::SetBurstInterval(burst_interval));
        self
    }

    /// See [`TaskQueuePacer::set_queue_time_limit`].
    pub fn set_queue_time_limit(&mut self, limit: Option<Duration>) -> &mut Self {
        self.ops.push(Op::SetQueueTimeLimit(limit));
        self
    }

    /// See [`TaskQueuePacer::enqueue_packets`].
    pub fn enqueue_packets(&mut self, packets: impl IntoIterator<Item = Packet>) -> &mut Self {
        self.ops.push(Op::Enqueue(packets.into_iter().collect()));
        self
    }

    /// See [`TaskQueuePacer::remove_packets_for_stream`].
    pub fn remove_packets_for_stream(&mut self, stream_id: StreamId) -> &mut Self {
        self.ops.push(Op::RemoveForStream(stream_id));
        self
    }

    /// See [`TaskQueuePacer::create_probe_clusters`].
    pub fn create_probe_clusters(
        &mut self,
        configs: impl IntoIterator<Item = ProbeClusterConfig>,
    ) -> &mut Self {
        let configs: Vec<_> = configs.into_iter().collect();
        match configs.iter().try_for_each(|c| c.validate()) {
            Ok(()) => self.ops.push(Op::CreateProbeClusters(configs)),
            Err(e) => self.fail(e),
        }
        self
    }

    fn fail(&mut self, error: PacerError) {
        // The first error is the one reported.
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

fn validate_rates(media_rate: Bitrate, padding_rate: Bitrate) -> Result<(), PacerError> {
    for rate in [media_rate, padding_rate] {
        if !rate.is_valid() {
            return Err(PacerError::InvalidRate { rate });
        }
    }
    Ok(())
}

fn run_worker<S: PacketSender, C: Clock>(
    mut controller: PacingController,
    mut sender: S,
    clock: C,
    rx: Receiver<Message>,
    stats: Arc<Mutex<PacerStats>>,
) {
    debug!("Pacer worker started");

    loop {
        let now = clock.now();
        process_due(&mut controller, &mut sender, now);
        publish(&controller, now, &stats);

        // The one timer. Every message or expiry recomputes it.
        let message = match controller.poll_timeout().0 {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(m) => Some(m),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(m) => Some(m),
                Err(_) => break,
            },
        };

        let Some(message) = message else {
            continue;
        };

        match message {
            Message::Ops(ops) => {
                let now = clock.now();
                for op in ops {
                    apply(&mut controller, now, op);
                }
            }
            Message::Flush(reply) => {
                let now = clock.now();
                process_due(&mut controller, &mut sender, now);
                let _ = reply.send(controller.stats(now));
            }
            Message::Shutdown => break,
        }
    }

    debug!(
        discarded = controller.queue_packet_count(),
        "Pacer worker stopped"
    );
}

fn process_due<S: PacketSender>(controller: &mut PacingController, sender: &mut S, now: Instant) {
    if let (Some(at), _) = controller.poll_timeout() {
        if at <= now {
            controller.process(now, sender);
        }
    }
}

fn publish(controller: &PacingController, now: Instant, stats: &Mutex<PacerStats>) {
    if let Ok(mut s) = stats.lock() {
        *s = controller.stats(now);
    }
}

fn apply(controller: &mut PacingController, now: Instant, op: Op) {
    let result = match op {
        Op::Start => {
            controller.start(now);
            Ok(())
        }
        Op::SetRates(media_rate, padding_rate) => {
            controller.set_rates(now, media_rate, padding_rate)
        }
        Op::SetBurstInterval(burst_interval) => {
            controller.set_burst_interval(now, burst_interval);
            Ok(())
        }
        Op::SetQueueTimeLimit(limit) => {
            controller.set_queue_time_limit(now, limit);
            Ok(())
        }
        Op::Enqueue(packets) => {
            controller.enqueue_packets(now, packets);
            Ok(())
        }
        Op::RemoveForStream(stream_id) => {
            controller.remove_packets_for_stream(now, stream_id);
            Ok(())
        }
        Op::CreateProbeClusters(configs) => controller.create_probe_clusters(now, configs),
    };

    // Validated before posting.
    if let Err(e) = result {
        warn!("Pacer operation failed: {}", e);
    }
}
