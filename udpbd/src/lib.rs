//! UDPBD (UDP Block Device) protocol implementation.
//!
//! This crate provides the UDPBD wire format, the transfer planning shared by
//! both ends of a connection, and an async client.
//!
//! Based on https://github.com/israpps/udpbd-server

mod client;
mod protocol;
mod transfer;

pub use client::UdpbdClient;
pub use protocol::*;
pub use transfer::{ChunkSpec, TransferPlan, block_shift_for, blocks_per_packet, packet_capacity};
