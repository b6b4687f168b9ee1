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

//! Fixed size wire frame.
//!
//! Frame layout, all multi-byte fields little-endian:
//!
//! | Offset | Size | Field          |
//! |--------|------|----------------|
//! | 0      | 1    | start marker   |
//! | 1      | 1    | packet kind    |
//! | 2      | 4    | datagram id    |
//! | 6      | 1    | sequence       |
//! | 7      | 2    | payload length |
//! | 9      | 128  | payload        |
//! | 137    | 4    | payload CRC32  |
//! | 141    | 1    | end marker     |

use crate::crc::crc32_words;
use crate::error::FotaError;
use crate::{PACKET_PAYLOAD_SIZE, PACKET_SERIALIZED_SIZE, words_for};

pub const PACKET_SOF: u8 = 0xAA;
pub const PACKET_EOF: u8 = 0xBB;

const KIND_OFFSET: usize = 1;
const DATAGRAM_ID_OFFSET: usize = 2;
const SEQUENCE_OFFSET: usize = 6;
const LENGTH_OFFSET: usize = 7;
const PAYLOAD_OFFSET: usize = 9;
const CRC_OFFSET: usize = PAYLOAD_OFFSET + PACKET_PAYLOAD_SIZE;
const EOF_OFFSET: usize = CRC_OFFSET + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketKind {
    Data = 0,
    Header = 1,
    Ack = 2,
    Nack = 3,
    Error = 4,
}

impl TryFrom<u8> for PacketKind {
    type Error = FotaError;

    fn try_from(value: u8) -> Result<Self, FotaError> {
        match value {
            0 => Ok(PacketKind::Data),
            1 => Ok(PacketKind::Header),
            2 => Ok(PacketKind::Ack),
            3 => Ok(PacketKind::Nack),
            4 => Ok(PacketKind::Error),
            _ => Err(FotaError::InvalidPacket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub datagram_id: u32,
    pub sequence: u8,
    /// Bytes of `payload` in use, never more than [`PACKET_PAYLOAD_SIZE`]
    pub payload_length: u16,
    pub payload: [u8; PACKET_PAYLOAD_SIZE],
    pub crc32: u32,
}

impl Packet {
    /// Creates a zero filled packet with no CRC set.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: if `length` is larger than a packet payload
    pub fn new(kind: PacketKind, sequence: u8, length: u16) -> Result<Self, FotaError> {
        if length as usize > PACKET_PAYLOAD_SIZE {
            return Err(FotaError::InvalidArgs);
        }
        Ok(Self {
            kind,
            datagram_id: 0,
            sequence,
            payload_length: length,
            payload: [0u8; PACKET_PAYLOAD_SIZE],
            crc32: 0,
        })
    }

    /// Zero filled placeholder used to size packet arrays.
    pub const fn empty() -> Self {
        Self {
            kind: PacketKind::Data,
            datagram_id: 0,
            sequence: 0,
            payload_length: 0,
            payload: [0u8; PACKET_PAYLOAD_SIZE],
            crc32: 0,
        }
    }

    /// Copies `data` into the payload and records its length. The CRC is not
    /// touched; call [`Packet::set_crc`] once the packet is final.
    pub fn set_payload(&mut self, data: &[u8]) -> Result<(), FotaError> {
        if data.len() > PACKET_PAYLOAD_SIZE {
            return Err(FotaError::InvalidArgs);
        }
        self.payload = [0u8; PACKET_PAYLOAD_SIZE];
        self.payload[..data.len()].copy_from_slice(data);
        self.payload_length = data.len() as u16;
        Ok(())
    }

    /// The part of the payload in use.
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_length as usize).min(PACKET_PAYLOAD_SIZE);
        &self.payload[..len]
    }

    fn payload_crc(&self) -> u32 {
        crc32_words(&self.payload, words_for(self.payload_length as usize))
    }

    pub fn set_crc(&mut self) {
        self.crc32 = self.payload_crc();
    }

    /// # Errors
    ///
    /// - `CrcMismatch`: the stored CRC does not match the payload
    pub fn verify_crc(&self) -> Result<(), FotaError> {
        if self.payload_crc() == self.crc32 {
            Ok(())
        } else {
            Err(FotaError::CrcMismatch)
        }
    }

    /// Writes the wire form of the packet into `buffer`.
    ///
    /// Returns the number of bytes written on success.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: if the buffer cannot hold a whole frame
    pub fn serialize(&self, buffer: &mut [u8]) -> Result<usize, FotaError> {
        if buffer.len() < PACKET_SERIALIZED_SIZE {
            return Err(FotaError::InvalidArgs);
        }

        buffer[0] = PACKET_SOF;
        buffer[KIND_OFFSET] = self.kind as u8;
        buffer[DATAGRAM_ID_OFFSET..SEQUENCE_OFFSET].copy_from_slice(&self.datagram_id.to_le_bytes());
        buffer[SEQUENCE_OFFSET] = self.sequence;
        buffer[LENGTH_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&self.payload_length.to_le_bytes());
        buffer[PAYLOAD_OFFSET..CRC_OFFSET].copy_from_slice(&self.payload);
        buffer[CRC_OFFSET..EOF_OFFSET].copy_from_slice(&self.crc32.to_le_bytes());
        buffer[EOF_OFFSET] = PACKET_EOF;

        Ok(PACKET_SERIALIZED_SIZE)
    }

    /// Parses a frame. The CRC is read but not checked, see [`Packet::verify_crc`].
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: if `buffer` is shorter than a frame
    /// - `InvalidPacket`: bad start or end marker, unknown kind or an
    ///   impossible payload length
    pub fn deserialize(buffer: &[u8]) -> Result<Self, FotaError> {
        if buffer.len() < PACKET_SERIALIZED_SIZE {
            return Err(FotaError::InvalidArgs);
        }
        if buffer[0] != PACKET_SOF || buffer[EOF_OFFSET] != PACKET_EOF {
            return Err(FotaError::InvalidPacket);
        }

        let kind = PacketKind::try_from(buffer[KIND_OFFSET])?;
        let payload_length = u16::from_le_bytes([buffer[LENGTH_OFFSET], buffer[LENGTH_OFFSET + 1]]);
        if payload_length as usize > PACKET_PAYLOAD_SIZE {
            return Err(FotaError::InvalidPacket);
        }

        let mut payload = [0u8; PACKET_PAYLOAD_SIZE];
        payload.copy_from_slice(&buffer[PAYLOAD_OFFSET..CRC_OFFSET]);

        Ok(Self {
            kind,
            datagram_id: read_u32(buffer, DATAGRAM_ID_OFFSET),
            sequence: buffer[SEQUENCE_OFFSET],
            payload_length,
            payload,
            crc32: read_u32(buffer, CRC_OFFSET),
        })
    }
}

pub(crate) fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buffer[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}
