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

use crate::datagram::payload::{
    Acknowledgement, FIRMWARE_ID_SIZE, FirmwareMetadata, JUMP_TO_APP_MAGIC, JumpToApp,
};
use crate::datagram::{Datagram, DatagramKind};
use crate::error::FotaError;

/// A builder for creating typed `Datagram`s.
pub struct DatagramBuilder {
    target_node: Option<u8>,
}

impl DatagramBuilder {
    pub fn new() -> Self {
        Self { target_node: None }
    }

    /// Address every datagram built from here to one node.
    pub fn target_node(mut self, node: Option<u8>) -> Self {
        self.target_node = node;
        self
    }

    pub fn firmware_metadata(self) -> FirmwareMetadataBuilder {
        FirmwareMetadataBuilder::new(self.target_node)
    }

    pub fn firmware_chunk<'a>(self, data: &'a [u8]) -> FirmwareChunkBuilder<'a> {
        FirmwareChunkBuilder {
            target_node: self.target_node,
            data,
        }
    }

    pub fn jump_to_app(self) -> JumpToAppBuilder {
        JumpToAppBuilder {
            target_node: self.target_node,
            magic: JUMP_TO_APP_MAGIC,
        }
    }

    pub fn acknowledgement(self, ack: Acknowledgement) -> AcknowledgementBuilder {
        AcknowledgementBuilder {
            target_node: self.target_node,
            ack,
        }
    }
}

impl Default for DatagramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(kind: DatagramKind, id: u32, target_node: Option<u8>, data: &[u8]) -> Result<Datagram, FotaError> {
    let datagram = Datagram::init(kind, id, data)?;
    Ok(match target_node {
        Some(node) => datagram.with_target_node(node),
        None => datagram,
    })
}

pub struct FirmwareMetadataBuilder {
    target_node: Option<u8>,
    binary_size: Option<u32>,
    expected_crc32: Option<u32>,
    version: (u8, u8),
    firmware_id: [u8; FIRMWARE_ID_SIZE],
}

impl FirmwareMetadataBuilder {
    fn new(target_node: Option<u8>) -> Self {
        Self {
            target_node,
            binary_size: None,
            expected_crc32: None,
            version: (0, 0),
            firmware_id: [0u8; FIRMWARE_ID_SIZE],
        }
    }

    pub fn binary_size(mut self, size: u32) -> Self {
        self.binary_size = Some(size);
        self
    }

    pub fn expected_crc32(mut self, crc: u32) -> Self {
        self.expected_crc32 = Some(crc);
        self
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    /// Ids longer than 16 bytes are truncated.
    pub fn firmware_id(mut self, id: &[u8]) -> Self {
        let len = id.len().min(FIRMWARE_ID_SIZE);
        self.firmware_id = [0u8; FIRMWARE_ID_SIZE];
        self.firmware_id[..len].copy_from_slice(&id[..len]);
        self
    }

    /// Builds the `FirmwareMetadata` datagram.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: if `binary_size` or `expected_crc32` has not been set
    pub fn build(self, datagram_id: u32) -> Result<Datagram, FotaError> {
        let metadata = FirmwareMetadata {
            binary_size: self.binary_size.ok_or(FotaError::InvalidArgs)?,
            expected_crc32: self.expected_crc32.ok_or(FotaError::InvalidArgs)?,
            version_major: self.version.0,
            version_minor: self.version.1,
            firmware_id: self.firmware_id,
        };
        finish(DatagramKind::FirmwareMetadata, datagram_id, self.target_node, &metadata.encode())
    }
}

pub struct FirmwareChunkBuilder<'a> {
    target_node: Option<u8>,
    data: &'a [u8],
}

impl FirmwareChunkBuilder<'_> {
    /// Builds a `FirmwareChunk` datagram; the id is the chunk index.
    pub fn build(self, chunk_index: u32) -> Result<Datagram, FotaError> {
        finish(DatagramKind::FirmwareChunk, chunk_index, self.target_node, self.data)
    }
}

pub struct JumpToAppBuilder {
    target_node: Option<u8>,
    magic: u32,
}

impl JumpToAppBuilder {
    /// Overrides the jump magic, only useful for exercising the rejection path.
    pub fn magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    pub fn build(self, datagram_id: u32) -> Result<Datagram, FotaError> {
        let request = JumpToApp {
            magic: self.magic,
            validation: 1,
        };
        finish(DatagramKind::JumpToApp, datagram_id, self.target_node, &request.encode())
    }
}

pub struct AcknowledgementBuilder {
    target_node: Option<u8>,
    ack: Acknowledgement,
}

impl AcknowledgementBuilder {
    /// Acknowledgements reuse the id of the datagram they answer.
    pub fn build(self) -> Result<Datagram, FotaError> {
        finish(
            DatagramKind::Acknowledgement,
            self.ack.response_to_id,
            self.target_node,
            &self.ack.encode(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_needs_size_and_crc() {
        let missing = DatagramBuilder::new().firmware_metadata().binary_size(10).build(0);
        assert!(matches!(missing, Err(FotaError::InvalidArgs)));

        let datagram = DatagramBuilder::new()
            .target_node(Some(2))
            .firmware_metadata()
            .binary_size(512)
            .expected_crc32(0xCAFE_F00D)
            .version(1, 4)
            .firmware_id(b"TEST_FW_ID_01")
            .build(100)
            .unwrap();

        assert_eq!(datagram.kind(), DatagramKind::FirmwareMetadata);
        assert_eq!(datagram.datagram_id(), 100);
        assert_eq!(datagram.header().target_node, Some(2));

        let metadata = FirmwareMetadata::decode(datagram.data()).unwrap();
        assert_eq!(metadata.binary_size, 512);
        assert_eq!(metadata.expected_crc32, 0xCAFE_F00D);
        assert_eq!((metadata.version_major, metadata.version_minor), (1, 4));
        assert_eq!(metadata.firmware_id_bytes(), b"TEST_FW_ID_01");
    }

    #[test]
    fn long_firmware_id_is_truncated() {
        let datagram = DatagramBuilder::new()
            .firmware_metadata()
            .binary_size(1)
            .expected_crc32(1)
            .firmware_id(b"A_FIRMWARE_ID_THAT_IS_TOO_LONG")
            .build(0)
            .unwrap();
        let metadata = FirmwareMetadata::decode(datagram.data()).unwrap();
        assert_eq!(metadata.firmware_id_bytes(), b"A_FIRMWARE_ID_TH");
    }

    #[test]
    fn jump_request_carries_magic() {
        let datagram = DatagramBuilder::new().jump_to_app().build(9).unwrap();
        assert_eq!(datagram.kind(), DatagramKind::JumpToApp);
        assert!(JumpToApp::decode(datagram.data()).is_ok());
    }

    #[test]
    fn chunk_id_is_chunk_index() {
        let datagram = DatagramBuilder::new().firmware_chunk(&[1, 2, 3]).build(4).unwrap();
        assert_eq!(datagram.datagram_id(), 4);
        assert_eq!(datagram.data(), &[1, 2, 3]);
    }
}
