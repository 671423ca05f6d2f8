use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::pacer::ProbeClusterId;
use crate::units::{Bitrate, DataSize};

/// The media class of an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Audio. Never paced.
    Audio,
    /// Video media.
    Video,
    /// Resends of earlier media, typically as requested by NACK.
    Retransmission,
    /// Redundancy data used to repair losses at the receiver.
    ForwardErrorCorrection,
    /// Filler to inflate the used bandwidth.
    Padding,
}

impl PacketKind {
    pub(crate) const ALL: [PacketKind; 5] = [
        PacketKind::Audio,
        PacketKind::Retransmission,
        PacketKind::ForwardErrorCorrection,
        PacketKind::Video,
        PacketKind::Padding,
    ];

    /// Audio bypasses the pacing budget entirely.
    pub fn is_unpaced(&self) -> bool {
        matches!(self, PacketKind::Audio)
    }

    /// Send order between classes. Lower sends first.
    pub(crate) fn priority(&self) -> usize {
        match self {
            PacketKind::Audio => 0,
            PacketKind::Retransmission => 1,
            PacketKind::ForwardErrorCorrection => 2,
            PacketKind::Video => 3,
            PacketKind::Padding => 4,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Audio => write!(f, "audio"),
            PacketKind::Video => write!(f, "video"),
            PacketKind::Retransmission => write!(f, "retransmission"),
            PacketKind::ForwardErrorCorrection => write!(f, "fec"),
            PacketKind::Padding => write!(f, "padding"),
        }
    }
}

/// Identifies a logical flow of packets, such as one SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(u32);

impl StreamId {
    /// Stream id from a raw value.
    pub const fn new(v: u32) -> Self {
        StreamId(v)
    }
}

impl From<u32> for StreamId {
    fn from(v: u32) -> Self {
        StreamId(v)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An outbound packet as seen by the pacer.
///
/// The pacer never looks inside a packet. It only cares about its class, which stream it
/// belongs to and its size on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Media class.
    pub kind: PacketKind,
    /// The stream the packet belongs to.
    pub stream_id: StreamId,
    /// Size on the wire.
    pub size: DataSize,
    /// Free for the caller to use, such as an RTP sequence number.
    pub seq_no: u64,
    /// Set by the pacer when the packet is enqueued.
    pub(crate) enqueued_at: Option<Instant>,
}

impl Packet {
    /// A packet of `size` bytes on the wire.
    pub fn new(kind: PacketKind, stream_id: impl Into<StreamId>, size: usize) -> Self {
        Packet {
            kind,
            stream_id: stream_id.into(),
            size: DataSize::from(size),
            seq_no: 0,
            enqueued_at: None,
        }
    }

    /// Set the caller's sequence number.
    pub fn with_seq_no(mut self, seq_no: u64) -> Self {
        self.seq_no = seq_no;
        self
    }

    /// When the packet entered the pacer queue.
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }
}

/// Probe cluster metadata for a packet sent as part of a bandwidth probe.
///
/// The bandwidth estimator uses this to group feedback belonging to the same probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    /// The cluster the packet was sent for.
    pub cluster_id: ProbeClusterId,
    /// Rate the cluster probes for.
    pub target_rate: Bitrate,
    /// Number of probe bursts in the cluster.
    pub target_probe_count: usize,
    /// Bytes the cluster sends at the target rate.
    pub target_bytes: DataSize,
}
