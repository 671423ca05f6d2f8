use std::io;

use thiserror::Error;

use crate::pacer::ProbeClusterId;
use crate::units::Bitrate;

/// Errors for the pacer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PacerError {
    /// A rate that is negative, NaN or infinite.
    #[error("invalid rate: {rate:?}")]
    InvalidRate {
        /// The rejected rate.
        rate: Bitrate,
    },

    /// A probe cluster request that can never complete.
    #[error("invalid probe cluster {id}: {reason}")]
    InvalidProbeCluster {
        /// Id of the rejected cluster.
        id: ProbeClusterId,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The scheduling driver's worker thread is gone.
    #[error("pacer worker thread is not running")]
    Disconnected,

    /// Failed to spawn the scheduling driver's worker thread.
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Failure reported by a [`PacketSender`][crate::PacketSender] when handing a packet
/// to the network.
///
/// The pacer logs these and moves on. A packet is consumed whether the send
/// succeeded or not.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendError {
    /// The transport refused the packet.
    #[error("packet rejected: {0}")]
    Rejected(String),

    /// Other IO errors.
    #[error("{0}")]
    Io(#[from] io::Error),
}
