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

//! Datagram fragmentation and reassembly.
//!
//! A datagram travels as one header packet (sequence 0) followed by up to 16
//! data packets (sequence 1..=16). Data packet `n` carries the bytes at
//! `(n - 1) * 128` and may arrive in any order once the header is in.

pub mod builder;
pub mod payload;

use crate::crc::crc32_padded;
use crate::error::FotaError;
use crate::packet::{Packet, PacketKind, read_u32};
use crate::{MAX_DATAGRAM_SIZE, MAX_DATA_PACKETS, MAX_PACKETS_PER_DATAGRAM, PACKET_PAYLOAD_SIZE};

/// Length of the header packet payload.
pub const DATAGRAM_HEADER_SIZE: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DatagramKind {
    FirmwareMetadata = 0,
    FirmwareChunk = 1,
    UpdateRequest = 2,
    UpdateResponse = 3,
    Verification = 4,
    Acknowledgement = 5,
    JumpToApp = 6,
    Error = 7,
}

impl TryFrom<u8> for DatagramKind {
    type Error = FotaError;

    fn try_from(value: u8) -> Result<Self, FotaError> {
        match value {
            0 => Ok(DatagramKind::FirmwareMetadata),
            1 => Ok(DatagramKind::FirmwareChunk),
            2 => Ok(DatagramKind::UpdateRequest),
            3 => Ok(DatagramKind::UpdateResponse),
            4 => Ok(DatagramKind::Verification),
            5 => Ok(DatagramKind::Acknowledgement),
            6 => Ok(DatagramKind::JumpToApp),
            7 => Ok(DatagramKind::Error),
            _ => Err(FotaError::InvalidPacket),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DatagramHeader {
    pub kind: DatagramKind,
    pub datagram_id: u32,
    pub total_length: u32,
    /// Data packets, the header packet is not counted
    pub num_packets: u16,
    pub crc32: u32,
    pub target_node: Option<u8>,
}

impl DatagramHeader {
    const fn empty() -> Self {
        Self {
            kind: DatagramKind::FirmwareMetadata,
            datagram_id: 0,
            total_length: 0,
            num_packets: 0,
            crc32: 0,
            target_node: None,
        }
    }

    fn encode(&self, buffer: &mut [u8; DATAGRAM_HEADER_SIZE]) {
        buffer[0] = self.kind as u8;
        buffer[1..5].copy_from_slice(&self.datagram_id.to_le_bytes());
        buffer[5..9].copy_from_slice(&self.total_length.to_le_bytes());
        buffer[9..11].copy_from_slice(&self.num_packets.to_le_bytes());
        buffer[11..15].copy_from_slice(&self.crc32.to_le_bytes());
        match self.target_node {
            Some(node) => {
                buffer[15] = 1;
                buffer[16] = node;
            }
            None => {
                buffer[15] = 0;
                buffer[16] = 0;
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, FotaError> {
        if bytes.len() < DATAGRAM_HEADER_SIZE {
            return Err(FotaError::InvalidPacket);
        }
        let target_node = match bytes[15] {
            0 => None,
            1 => Some(bytes[16]),
            _ => return Err(FotaError::InvalidPacket),
        };
        Ok(Self {
            kind: DatagramKind::try_from(bytes[0])?,
            datagram_id: read_u32(bytes, 1),
            total_length: read_u32(bytes, 5),
            num_packets: u16::from_le_bytes([bytes[9], bytes[10]]),
            crc32: read_u32(bytes, 11),
            target_node,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblyState {
    Empty,
    Accumulating,
}

/// One datagram, either being built for sending or being reassembled.
pub struct Datagram {
    header: DatagramHeader,
    data: [u8; MAX_DATAGRAM_SIZE],
    received: [bool; MAX_PACKETS_PER_DATAGRAM],
    packets_received: u16,
    state: AssemblyState,
}

impl Datagram {
    /// An empty datagram ready to accept a header packet.
    pub const fn new() -> Self {
        Self {
            header: DatagramHeader::empty(),
            data: [0u8; MAX_DATAGRAM_SIZE],
            received: [false; MAX_PACKETS_PER_DATAGRAM],
            packets_received: 0,
            state: AssemblyState::Empty,
        }
    }

    /// Builds a datagram for sending, computing its packet count and CRC32.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: if `data` is larger than a datagram can carry
    pub fn init(kind: DatagramKind, datagram_id: u32, data: &[u8]) -> Result<Self, FotaError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(FotaError::InvalidArgs);
        }
        let mut datagram = Self::new();
        datagram.data[..data.len()].copy_from_slice(data);
        let num_packets = data.len().div_ceil(PACKET_PAYLOAD_SIZE) as u16;
        datagram.header = DatagramHeader {
            kind,
            datagram_id,
            total_length: data.len() as u32,
            num_packets,
            crc32: crc32_padded(data),
            target_node: None,
        };
        datagram.received[..=num_packets as usize].fill(true);
        datagram.packets_received = num_packets;
        datagram.state = AssemblyState::Accumulating;
        Ok(datagram)
    }

    /// Addresses the datagram to a single node.
    pub fn with_target_node(mut self, node: u8) -> Self {
        self.header.target_node = Some(node);
        self
    }

    pub fn header(&self) -> &DatagramHeader {
        &self.header
    }

    pub fn kind(&self) -> DatagramKind {
        self.header.kind
    }

    pub fn datagram_id(&self) -> u32 {
        self.header.datagram_id
    }

    /// The reassembled payload, `total_length` bytes long.
    pub fn data(&self) -> &[u8] {
        let len = (self.header.total_length as usize).min(MAX_DATAGRAM_SIZE);
        &self.data[..len]
    }

    /// Packets needed to send this datagram, header included.
    pub fn packet_count(&self) -> usize {
        self.header.num_packets as usize + 1
    }

    pub fn has_header(&self) -> bool {
        self.state != AssemblyState::Empty
    }

    /// Splits the datagram into its header packet followed by its data packets.
    ///
    /// Returns how many packets were written to `packets`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: if `packets` cannot hold [`Datagram::packet_count`] packets
    pub fn to_packets(&self, packets: &mut [Packet]) -> Result<usize, FotaError> {
        let count = self.packet_count();
        if packets.len() < count {
            return Err(FotaError::InvalidArgs);
        }
        for (sequence, slot) in packets[..count].iter_mut().enumerate() {
            *slot = self.packet(sequence)?;
        }
        Ok(count)
    }

    /// Builds the single packet with the given sequence number, CRC set.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: `sequence` is not below [`Datagram::packet_count`]
    pub fn packet(&self, sequence: usize) -> Result<Packet, FotaError> {
        if sequence >= self.packet_count() {
            return Err(FotaError::InvalidArgs);
        }

        let mut packet = if sequence == 0 {
            let mut header_bytes = [0u8; DATAGRAM_HEADER_SIZE];
            self.header.encode(&mut header_bytes);
            let mut packet = Packet::new(PacketKind::Header, 0, 0)?;
            packet.set_payload(&header_bytes)?;
            packet
        } else {
            let start = (sequence - 1) * PACKET_PAYLOAD_SIZE;
            let end = (start + PACKET_PAYLOAD_SIZE).min(self.data().len());
            let mut packet = Packet::new(PacketKind::Data, sequence as u8, 0)?;
            packet.set_payload(&self.data()[start..end])?;
            packet
        };
        packet.datagram_id = self.header.datagram_id;
        packet.set_crc();
        Ok(packet)
    }

    /// Applies a header packet.
    ///
    /// A header for the datagram already being assembled is ignored, so a
    /// retransmitted header never discards packets received so far. A header
    /// for any other datagram id starts over.
    ///
    /// # Errors
    ///
    /// - `InvalidPacket`: header payload malformed or its packet count does
    ///   not match its length
    /// - `ResourceExhausted`: declared length larger than a datagram
    pub fn process_header_packet(&mut self, packet: &Packet) -> Result<(), FotaError> {
        let header = DatagramHeader::decode(packet.payload())?;

        if self.state != AssemblyState::Empty && self.header.datagram_id == header.datagram_id {
            log::trace!("Repeated header for datagram {}", header.datagram_id);
            return Ok(());
        }

        if header.total_length as usize > MAX_DATAGRAM_SIZE || header.num_packets as usize > MAX_DATA_PACKETS {
            return Err(FotaError::ResourceExhausted);
        }
        if header.num_packets as usize != (header.total_length as usize).div_ceil(PACKET_PAYLOAD_SIZE) {
            return Err(FotaError::InvalidPacket);
        }

        self.reset();
        self.header = header;
        self.received[0] = true;
        self.state = AssemblyState::Accumulating;
        log::debug!(
            "Datagram {} started: {:?}, {} bytes in {} packets",
            header.datagram_id,
            header.kind,
            header.total_length,
            header.num_packets
        );
        Ok(())
    }

    /// Applies a data packet in whatever order it arrives.
    ///
    /// # Errors
    ///
    /// - `InternalError`: no header yet, packet for another datagram,
    ///   sequence 0 or past the declared count, or a slot already filled
    pub fn process_data_packet(&mut self, packet: &Packet) -> Result<(), FotaError> {
        if self.state == AssemblyState::Empty || packet.datagram_id != self.header.datagram_id {
            return Err(FotaError::InternalError);
        }

        let sequence = packet.sequence as usize;
        if sequence == 0 || sequence > self.header.num_packets as usize {
            return Err(FotaError::InternalError);
        }
        let Some(slot) = self.received.get_mut(sequence) else {
            return Err(FotaError::InternalError);
        };
        if *slot {
            return Err(FotaError::InternalError);
        }

        let offset = (sequence - 1) * PACKET_PAYLOAD_SIZE;
        let payload = packet.payload();
        let Some(destination) = self.data.get_mut(offset..offset + payload.len()) else {
            return Err(FotaError::InternalError);
        };
        destination.copy_from_slice(payload);
        *slot = true;
        self.packets_received += 1;

        log::trace!(
            "Datagram {} packet {} stored, {}/{}",
            self.header.datagram_id,
            sequence,
            self.packets_received,
            self.header.num_packets
        );
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state != AssemblyState::Empty && self.packets_received == self.header.num_packets
    }

    /// Checks the reassembled bytes against the CRC32 from the header.
    ///
    /// # Errors
    ///
    /// - `InternalError`: the datagram is not complete yet
    /// - `CrcMismatch`: the data does not match the header CRC
    pub fn verify(&self) -> Result<(), FotaError> {
        if !self.is_complete() {
            return Err(FotaError::InternalError);
        }
        if crc32_padded(self.data()) == self.header.crc32 {
            Ok(())
        } else {
            Err(FotaError::CrcMismatch)
        }
    }

    /// Drops all state, leaving the datagram ready for a new header.
    pub fn reset(&mut self) {
        self.header = DatagramHeader::empty();
        self.data.fill(0);
        self.received = [false; MAX_PACKETS_PER_DATAGRAM];
        self.packets_received = 0;
        self.state = AssemblyState::Empty;
    }
}

impl Default for Datagram {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Datagram {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Datagram")
            .field("header", &self.header)
            .field("packets_received", &self.packets_received)
            .field("complete", &self.is_complete())
            .finish()
    }
}
