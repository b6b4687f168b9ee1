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

use embedded_storage::nor_flash::NorFlash;

use crate::datagram::payload::{FIRMWARE_ID_SIZE, FirmwareMetadata};
use crate::error::FotaError;
use crate::flash;
use crate::packet::read_u32;

/// "FOTA" read as a little-endian word.
const IMAGE_RECORD_MAGIC: u32 = 0x4154_4F46;

/// What was installed into the active region, kept in its own flash page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageRecord {
    pub binary_size: u32,
    pub crc32: u32,
    pub version_major: u8,
    pub version_minor: u8,
    pub firmware_id: [u8; FIRMWARE_ID_SIZE],
}

impl ImageRecord {
    pub const ENCODED_SIZE: usize = 32;

    fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut bytes = [0u8; Self::ENCODED_SIZE];
        bytes[0..4].copy_from_slice(&IMAGE_RECORD_MAGIC.to_le_bytes());
        bytes[4] = self.version_major;
        bytes[5] = self.version_minor;
        bytes[8..12].copy_from_slice(&self.binary_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.firmware_id);
        bytes
    }

    /// Rewrites the record page.
    pub fn store<F: NorFlash>(&self, flash: &mut F, offset: u32) -> Result<(), FotaError> {
        flash::erase(flash, offset, offset + F::ERASE_SIZE as u32)?;
        flash::write(flash, offset, &self.encode())
    }

    /// Erases the record page so nothing vouches for the active region.
    pub fn clear<F: NorFlash>(flash: &mut F, offset: u32) -> Result<(), FotaError> {
        flash::erase(flash, offset, offset + F::ERASE_SIZE as u32)
    }

    /// Reads the record page, `None` if it holds no record.
    pub fn load<F: NorFlash>(flash: &mut F, offset: u32) -> Result<Option<Self>, FotaError> {
        let mut bytes = [0u8; Self::ENCODED_SIZE];
        flash::read(flash, offset, &mut bytes)?;
        if read_u32(&bytes, 0) != IMAGE_RECORD_MAGIC {
            return Ok(None);
        }
        let mut firmware_id = [0u8; FIRMWARE_ID_SIZE];
        firmware_id.copy_from_slice(&bytes[16..32]);
        Ok(Some(Self {
            binary_size: read_u32(&bytes, 8),
            crc32: read_u32(&bytes, 12),
            version_major: bytes[4],
            version_minor: bytes[5],
            firmware_id,
        }))
    }
}

impl From<&FirmwareMetadata> for ImageRecord {
    fn from(metadata: &FirmwareMetadata) -> Self {
        Self {
            binary_size: metadata.binary_size,
            crc32: metadata.expected_crc32,
            version_major: metadata.version_major,
            version_minor: metadata.version_minor,
            firmware_id: metadata.firmware_id,
        }
    }
}
