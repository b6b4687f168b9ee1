#![cfg_attr(not(test), no_std)]
// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

//! Firmware-over-the-air transport and installation.
//!
//! The crate is layered bottom up:
//!
//! - [`packet`]: fixed size 142 byte frames with a payload CRC32
//! - [`datagram`]: reassembly of up to 2048 byte messages from packets
//! - [`packet_manager`]: turns a byte stream into verified datagrams
//! - [`dfu`]: stages, verifies and commits a firmware image in flash
//! - [`node`]: the polling loop a device runs to tie it all together

pub mod crc;
pub mod datagram;
pub mod dfu;
pub mod error;
pub mod flash;
pub mod jump;
pub mod network;
pub mod node;
pub mod packet;
pub mod packet_manager;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use error::{FlashError, FotaError};

/// Bytes of payload carried by one packet.
pub const PACKET_PAYLOAD_SIZE: usize = 128;

/// Size of a packet on the wire, markers and CRC included.
pub const PACKET_SERIALIZED_SIZE: usize = 142;

/// Largest payload a single datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Data packets in a full datagram.
pub const MAX_DATA_PACKETS: usize = MAX_DATAGRAM_SIZE / PACKET_PAYLOAD_SIZE;

/// Data packets plus the header packet.
pub const MAX_PACKETS_PER_DATAGRAM: usize = MAX_DATA_PACKETS + 1;

/// Per read timeout applied by the network reader.
pub const TRANSPORT_TIMEOUT_MS: u64 = 10;

/// Silence after which the node gives up and jumps to the application.
pub const SESSION_INACTIVITY_TIMEOUT_MS: u64 = 15_000;

/// Round a byte count up to whole 32 bit words.
pub(crate) const fn words_for(len: usize) -> usize {
    len.div_ceil(4)
}
