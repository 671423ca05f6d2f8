#![allow(unused)]
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use paced_sender::{DataSize, Packet, PacketKind, PacketSender, ProbeInfo, SendError};
use paced_sender::{PacerConfig, PacerReason, PacingController};

/// A packet as it was handed to the sender.
#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Instant,
    pub packet: Packet,
    pub probe: Option<ProbeInfo>,
}

/// Sender recording everything it is given, at the simulated time.
pub struct Recorder {
    pub now: Instant,
    pub sent: Vec<Sent>,
    /// Answer padding requests with one packet of the requested size.
    pub padding: bool,
    pub padding_requests: Vec<DataSize>,
}

impl Recorder {
    pub fn new(now: Instant) -> Self {
        Recorder {
            now,
            sent: vec![],
            padding: false,
            padding_requests: vec![],
        }
    }

    pub fn probes(&self) -> impl Iterator<Item = &Sent> {
        self.sent.iter().filter(|s| s.probe.is_some())
    }
}

impl PacketSender for Recorder {
    fn send_packet(&mut self, packet: Packet, probe: Option<ProbeInfo>) -> Result<(), SendError> {
        self.sent.push(Sent {
            at: self.now,
            packet,
            probe,
        });
        Ok(())
    }

    fn generate_padding(&mut self, target: DataSize) -> Vec<Packet> {
        self.padding_requests.push(target);
        if !self.padding {
            return vec![];
        }
        vec![Packet::new(PacketKind::Padding, 0, target.as_bytes_usize())]
    }
}

/// Drives a [`PacingController`] in simulated time.
pub struct Sim {
    pub pacer: PacingController,
    pub sender: Recorder,
    pub start: Instant,
    pub now: Instant,
}

impl Sim {
    /// A started pacer.
    pub fn new(config: PacerConfig) -> Self {
        let start = Instant::now();
        let mut pacer = PacingController::new(config).expect("valid config");
        pacer.start(start);

        Sim {
            pacer,
            sender: Recorder::new(start),
            start,
            now: start,
        }
    }

    pub fn enqueue(&mut self, packets: impl IntoIterator<Item = Packet>) {
        self.pacer.enqueue_packets(self.now, packets);
    }

    /// Move time forward by `d`, processing at every wakeup on the way.
    pub fn advance(&mut self, d: Duration) {
        self.run_until(self.now + d);
    }

    /// Process at every wakeup up to and including `end`.
    pub fn run_until(&mut self, end: Instant) {
        for _ in 0..1_000_000 {
            match self.pacer.poll_timeout() {
                (Some(at), _) if at <= end => {
                    self.now = self.now.max(at);
                    self.sender.now = self.now;
                    self.pacer.process(self.now, &mut self.sender);
                }
                _ => {
                    self.now = end;
                    self.sender.now = end;
                    return;
                }
            }
        }
        panic!("pacer kept waking up at the same time");
    }

    /// Process until the queue is empty, giving up after `limit`.
    pub fn drain(&mut self, limit: Duration) {
        let end = self.now + limit;
        while self.pacer.queue_packet_count() > 0 && self.now < end {
            let next = match self.pacer.poll_timeout() {
                (Some(at), _) => at.min(end).max(self.now),
                (None, _) => break,
            };
            self.run_until(next);
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sender.sent.len()
    }

    pub fn since_start(&self, t: Instant) -> Duration {
        t - self.start
    }
}

/// Sender usable from the driver's worker thread. Clones share the same log.
#[derive(Clone, Default)]
pub struct SharedSender {
    pub sent: Arc<Mutex<Vec<(Instant, Packet)>>>,
}

impl SharedSender {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<(Instant, Packet)> {
        self.sent.lock().unwrap().clone()
    }
}

impl PacketSender for SharedSender {
    fn send_packet(&mut self, packet: Packet, _probe: Option<ProbeInfo>) -> Result<(), SendError> {
        self.sent.lock().unwrap().push((Instant::now(), packet));
        Ok(())
    }

    fn generate_padding(&mut self, _target: DataSize) -> Vec<Packet> {
        vec![]
    }
}

/// Poll `f` until it holds, or panic after `timeout`.
pub fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !f() {
        assert!(Instant::now() < deadline, "Condition not met within {timeout:?}");
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn video(stream: u32, size: usize) -> Packet {
    Packet::new(PacketKind::Video, stream, size)
}

pub fn audio(stream: u32, size: usize) -> Packet {
    Packet::new(PacketKind::Audio, stream, size)
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}
