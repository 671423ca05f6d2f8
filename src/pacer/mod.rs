//! Packet pacing.
//!
//! The [`PacingController`] is the Sans-IO core. It is fed packets, rates and probe requests,
//! and tells through [`PacingController::poll_timeout`] when it next wants
//! [`PacingController::process`] to be called. It never reads a clock itself.

use crate::error::SendError;
use crate::packet::{Packet, ProbeInfo};
use crate::units::DataSize;

mod macros;

mod budget;
mod controller;
mod probe;
mod queue;

pub use controller::{PacerStats, PacingController};
pub use probe::{ProbeClusterConfig, ProbeClusterId};

/// The capabilities the pacer needs from the transport.
///
/// All methods are called on the pacer's execution context, one at a time. They must not
/// block for long since that stalls pacing of every stream.
pub trait PacketSender {
    /// Put a packet on the network.
    ///
    /// `probe` is set when the packet is part of a probe cluster. The packet is consumed even
    /// if this fails, the pacer never retries.
    fn send_packet(&mut self, packet: Packet, probe: Option<ProbeInfo>) -> Result<(), SendError>;

    /// Redundancy packets to go out after a video packet, such as FEC.
    ///
    /// Called after every sent video packet. The returned packets are enqueued and paced
    /// like any other.
    fn fetch_redundancy(&mut self) -> Vec<Packet> {
        vec![]
    }

    /// Produce padding packets adding up to at least `target` bytes.
    ///
    /// Returning nothing is fine, the pacer backs off and asks again later.
    fn generate_padding(&mut self, target: DataSize) -> Vec<Packet>;
}

impl<S: PacketSender + ?Sized> PacketSender for &mut S {
    fn send_packet(&mut self, packet: Packet, probe: Option<ProbeInfo>) -> Result<(), SendError> {
        (**self).send_packet(packet, probe)
    }

    fn fetch_redundancy(&mut self) -> Vec<Packet> {
        (**self).fetch_redundancy()
    }

    fn generate_padding(&mut self, target: DataSize) -> Vec<Packet> {
        (**self).generate_padding(target)
    }
}

impl<S: PacketSender + ?Sized> PacketSender for Box<S> {
    fn send_packet(&mut self, packet: Packet, probe: Option<ProbeInfo>) -> Result<(), SendError> {
        (**self).send_packet(packet, probe)
    }

    fn fetch_redundancy(&mut self) -> Vec<Packet> {
        (**self).fetch_redundancy()
    }

    fn generate_padding(&mut self, target: DataSize) -> Vec<Packet> {
        (**self).generate_padding(target)
    }
}

/// Why the pacer wants to be woken up.
///
/// This enum is not considered stable API and may change in minor revisions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PacerReason {
    /// Nothing to do until something is enqueued or reconfigured.
    #[default]
    Idle,
    /// Unpaced content such as audio.
    Unpaced,
    /// Next burst of a probe cluster.
    Probe,
    /// Regular paced content like video.
    Paced,
    /// Paced content held back to send several packets in one go.
    Coalescing,
    /// Padding to inflate used bandwidth.
    Padding,
}
