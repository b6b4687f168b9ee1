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

//! Typed payloads carried inside datagrams. All little-endian.

use crate::datagram::DatagramKind;
use crate::error::FotaError;
use crate::packet::read_u32;

pub const FIRMWARE_ID_SIZE: usize = 16;

/// Magic a jump request must carry before the node will leave the bootloader.
pub const JUMP_TO_APP_MAGIC: u32 = 0xDEAD_BEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareMetadata {
    pub binary_size: u32,
    pub expected_crc32: u32,
    pub version_major: u8,
    pub version_minor: u8,
    /// ASCII, zero padded
    pub firmware_id: [u8; FIRMWARE_ID_SIZE],
}

impl FirmwareMetadata {
    pub const ENCODED_SIZE: usize = 10 + FIRMWARE_ID_SIZE;

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut bytes = [0u8; Self::ENCODED_SIZE];
        bytes[0..4].copy_from_slice(&self.binary_size.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.expected_crc32.to_le_bytes());
        bytes[8] = self.version_major;
        bytes[9] = self.version_minor;
        bytes[10..].copy_from_slice(&self.firmware_id);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FotaError> {
        if bytes.len() < Self::ENCODED_SIZE {
            return Err(FotaError::InvalidDatagram);
        }
        let mut firmware_id = [0u8; FIRMWARE_ID_SIZE];
        firmware_id.copy_from_slice(&bytes[10..Self::ENCODED_SIZE]);
        Ok(Self {
            binary_size: read_u32(bytes, 0),
            expected_crc32: read_u32(bytes, 4),
            version_major: bytes[8],
            version_minor: bytes[9],
            firmware_id,
        })
    }

    /// Firmware id up to the first zero byte.
    pub fn firmware_id_bytes(&self) -> &[u8] {
        let end = self.firmware_id.iter().position(|b| *b == 0).unwrap_or(FIRMWARE_ID_SIZE);
        &self.firmware_id[..end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JumpToApp {
    pub magic: u32,
    pub validation: u8,
}

impl JumpToApp {
    pub const ENCODED_SIZE: usize = 5;

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut bytes = [0u8; Self::ENCODED_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4] = self.validation;
        bytes
    }

    /// Decodes and checks a jump request.
    ///
    /// # Errors
    ///
    /// - `InvalidDatagram`: short payload, wrong magic or validation flag not set
    pub fn decode(bytes: &[u8]) -> Result<Self, FotaError> {
        if bytes.len() < Self::ENCODED_SIZE {
            return Err(FotaError::InvalidDatagram);
        }
        let request = Self {
            magic: read_u32(bytes, 0),
            validation: bytes[4],
        };
        if request.magic != JUMP_TO_APP_MAGIC || request.validation != 1 {
            return Err(FotaError::InvalidDatagram);
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AckStatus {
    Ack = 0,
    Nack = 1,
}

/// Answer from the node for one handled datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Acknowledgement {
    pub status: AckStatus,
    pub response_to: DatagramKind,
    pub response_to_id: u32,
    /// [`FotaError::code`] of the failure, 0 for an ACK
    pub error_code: u32,
}

impl Acknowledgement {
    pub const ENCODED_SIZE: usize = 10;

    pub fn for_result(response_to: DatagramKind, response_to_id: u32, result: Result<(), FotaError>) -> Self {
        let (status, error_code) = match result {
            Ok(()) => (AckStatus::Ack, 0),
            Err(e) => (AckStatus::Nack, e.code()),
        };
        Self {
            status,
            response_to,
            response_to_id,
            error_code,
        }
    }

    /// The error carried by a NACK, if the code is one this build knows.
    pub fn error(&self) -> Option<FotaError> {
        FotaError::from_code(self.error_code)
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut bytes = [0u8; Self::ENCODED_SIZE];
        bytes[0] = self.status as u8;
        bytes[1] = self.response_to as u8;
        bytes[2..6].copy_from_slice(&self.response_to_id.to_le_bytes());
        bytes[6..10].copy_from_slice(&self.error_code.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FotaError> {
        if bytes.len() < Self::ENCODED_SIZE {
            return Err(FotaError::InvalidDatagram);
        }
        let status = match bytes[0] {
            0 => AckStatus::Ack,
            1 => AckStatus::Nack,
            _ => return Err(FotaError::InvalidDatagram),
        };
        Ok(Self {
            status,
            response_to: DatagramKind::try_from(bytes[1]).map_err(|_| FotaError::InvalidDatagram)?,
            response_to_id: read_u32(bytes, 2),
            error_code: read_u32(bytes, 6),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_layout() {
        let mut firmware_id = [0u8; FIRMWARE_ID_SIZE];
        firmware_id[..13].copy_from_slice(b"TEST_FW_ID_01");
        let metadata = FirmwareMetadata {
            binary_size: 512,
            expected_crc32: 0x0102_0304,
            version_major: 1,
            version_minor: 2,
            firmware_id,
        };
        let bytes = metadata.encode();
        assert_eq!(&bytes[0..4], &[0x00, 0x02, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], 2);

        let decoded = FirmwareMetadata::decode(&bytes).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.firmware_id_bytes(), b"TEST_FW_ID_01");
    }

    #[test]
    fn short_metadata_is_invalid() {
        assert_eq!(FirmwareMetadata::decode(&[0u8; 10]), Err(FotaError::InvalidDatagram));
    }

    #[test]
    fn jump_request_needs_magic_and_flag() {
        let good = JumpToApp {
            magic: JUMP_TO_APP_MAGIC,
            validation: 1,
        };
        assert_eq!(JumpToApp::decode(&good.encode()), Ok(good));

        let bad_magic = JumpToApp { magic: 0x1234_5678, validation: 1 };
        assert_eq!(JumpToApp::decode(&bad_magic.encode()), Err(FotaError::InvalidDatagram));

        let bad_flag = JumpToApp { magic: JUMP_TO_APP_MAGIC, validation: 0 };
        assert_eq!(JumpToApp::decode(&bad_flag.encode()), Err(FotaError::InvalidDatagram));
    }

    #[test]
    fn nack_carries_error_code() {
        let nack = Acknowledgement::for_result(DatagramKind::FirmwareChunk, 4, Err(FotaError::SequenceOutOfOrder));
        assert_eq!(nack.status, AckStatus::Nack);

        let decoded = Acknowledgement::decode(&nack.encode()).unwrap();
        assert_eq!(decoded.response_to_id, 4);
        assert_eq!(decoded.error(), Some(FotaError::SequenceOutOfOrder));

        let ack = Acknowledgement::for_result(DatagramKind::FirmwareMetadata, 0, Ok(()));
        assert_eq!(ack.error_code, 0);
        assert_eq!(ack.error(), None);
    }
}
