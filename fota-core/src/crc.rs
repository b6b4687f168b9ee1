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

//! CRC32 over word counted data.
//!
//! Every checksum in the protocol is taken over whole 32 bit words, so any
//! data that does not end on a word boundary is padded with zero bytes before
//! it is fed in. Sender and receiver must pad the same way.

use crc::{CRC_32_ISO_HDLC, Crc, Digest};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const ZERO_WORD: [u8; 4] = [0u8; 4];

/// Calculates the CRC32 of `word_count` words taken from the start of `data`.
///
/// If `data` is shorter than the requested words the missing bytes are
/// treated as zero.
pub fn crc32_words(data: &[u8], word_count: usize) -> u32 {
    let mut crc = ImageCrc::new();
    let byte_count = word_count * 4;
    let available = data.len().min(byte_count);
    crc.update(&data[..available]);
    crc.pad_zeros(byte_count - available);
    crc.finalize()
}

/// CRC32 of `data`, zero padded out to the next word boundary.
pub fn crc32_padded(data: &[u8]) -> u32 {
    crc32_words(data, crate::words_for(data.len()))
}

/// Streaming form of [`crc32_padded`] for data that cannot be held in one
/// slice, such as an image read back from flash block by block.
pub struct ImageCrc {
    digest: Digest<'static, u32>,
    length: usize,
}

impl ImageCrc {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
            length: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        self.length += bytes.len();
    }

    fn pad_zeros(&mut self, mut count: usize) {
        while count > 0 {
            let step = count.min(ZERO_WORD.len());
            self.update(&ZERO_WORD[..step]);
            count -= step;
        }
    }

    /// Pads the data seen so far to a word boundary and returns the checksum.
    pub fn finalize(mut self) -> u32 {
        let padding = crate::words_for(self.length) * 4 - self.length;
        self.pad_zeros(padding);
        self.digest.finalize()
    }
}

impl Default for ImageCrc {
    fn default() -> Self {
        Self::new()
    }
}
