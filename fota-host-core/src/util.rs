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

use fota_core::crc::ImageCrc;
use fota_core::datagram::payload::FIRMWARE_ID_SIZE;

/// Calculates the CRC32 the node will compute over the installed image
pub fn image_crc32(data: &[u8]) -> u32 {
    let mut hasher = ImageCrc::new();
    for block in data.chunks(256) {
        hasher.update(block);
    }
    hasher.finalize()
}

/// Packs a label into the fixed width firmware id, truncating or zero padding it
pub fn firmware_id_from_label(label: &str) -> [u8; FIRMWARE_ID_SIZE] {
    let mut id = [0u8; FIRMWARE_ID_SIZE];
    let len = usize::min(label.len(), FIRMWARE_ID_SIZE);
    id[..len].copy_from_slice(&label.as_bytes()[..len]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use fota_core::crc::crc32_padded;

    #[test]
    fn streamed_crc_matches_one_shot() {
        let data: Vec<u8> = (0..1001u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(image_crc32(&data), crc32_padded(&data));
    }

    #[test]
    fn long_labels_are_truncated() {
        assert_eq!(&firmware_id_from_label("app")[..4], b"app\0");
        assert_eq!(&firmware_id_from_label("a-very-long-firmware-name"), b"a-very-long-firm");
    }
}
