//! Packet pacing for real-time media.
//!
//! Given a stream of packets tagged by media class, the pacer releases them to the network at a
//! controlled rate, so that sends never burst above the configured bitrate. It also sends the
//! short, deliberately fast probe clusters a bandwidth estimator uses to test the link.
//!
//! The pacer does not decide *what* rate to use, it only spends a given rate over time.
//!
//! # Sans I/O core
//!
//! [`PacingController`] is a Sans I/O implementation, meaning it does no network talking and
//! reads no clock. Every call takes the current time, and [`PacingController::poll_timeout`]
//! tells when it next wants to [`process`][PacingController::process]. This makes it
//! straightforward to drive from any event loop, and to test with simulated time.
//!
//! ```
//! # use std::time::{Duration, Instant};
//! # use paced_sender::*;
//! # struct MySender;
//! # impl PacketSender for MySender {
//! #     fn send_packet(&mut self, _: Packet, _: Option<ProbeInfo>) -> Result<(), SendError> {
//! #         Ok(())
//! #     }
//! #     fn generate_padding(&mut self, _: DataSize) -> Vec<Packet> { vec![] }
//! # }
//! let mut pacer = PacingController::new(PacerConfig::new()).unwrap();
//! let mut sender = MySender;
//! let now = Instant::now();
//!
//! pacer.start(now);
//! pacer.set_rates(now, Bitrate::mbps(2), Bitrate::ZERO).unwrap();
//! pacer.enqueue_packets(now, [Packet::new(PacketKind::Video, 1, 1200)]);
//!
//! // The event loop.
//! loop {
//!     let (timeout, _reason) = pacer.poll_timeout();
//!
//!     let Some(timeout) = timeout else {
//!         // Nothing to do until something is enqueued.
//!         break;
//!     };
//!
//!     // Wait until timeout, or until something else happens, then
//!     let now = timeout;
//!     pacer.process(now, &mut sender);
//! }
//! ```
//!
//! # Threaded driver
//!
//! [`TaskQueuePacer`] runs a [`PacingController`] on a worker thread of its own, with a timer
//! that follows the controller's wakeups. Any thread can post operations to it.
//!
//! # Packet priority
//!
//! Audio is never paced: it goes out as soon as it is enqueued, whatever the budget. The
//! remaining classes are sent in the order retransmissions, forward error correction, video,
//! padding. Within a class packets go out in the order they were enqueued.
//!
//! # Logging
//!
//! The crate logs with [`tracing`](https://docs.rs/tracing).

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![warn(missing_docs)]

#[macro_use]
extern crate tracing;

mod config;
pub use config::PacerConfig;

mod driver;
pub use driver::{Batch, Clock, MonotonicClock, TaskQueuePacer};

pub mod error;
pub use error::{PacerError, SendError};

mod packet;
pub use packet::{Packet, PacketKind, ProbeInfo, StreamId};

mod pacer;
pub use pacer::{PacerReason, PacerStats, PacingController, PacketSender};
pub use pacer::{ProbeClusterConfig, ProbeClusterId};

mod units;
pub use units::{Bitrate, DataSize};

mod util;

macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        #[cfg(feature = "_internal_dont_use_log_stats")]
        {
            use std::time::SystemTime;
            use std::io::{self, Write};

            let now = SystemTime::now();
            let since_epoch = now.duration_since(SystemTime::UNIX_EPOCH).unwrap();
            let unix_time_ms = since_epoch.as_millis();
            let mut lock = io::stdout().lock();
            write!(lock, "{} ", $name).expect("Failed to write to stdout");

            $(
                write!(lock, "{},", $arg).expect("Failed to write to stdout");
            )+
            writeln!(lock, "{}", unix_time_ms).expect("Failed to write to stdout");
        }
    };
}
pub(crate) use log_stat;
