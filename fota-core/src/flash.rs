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

//! Thin helpers over `embedded_storage` NOR flash that speak [`FotaError`].

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::crc::ImageCrc;
use crate::error::{FlashError, FotaError};

/// Bytes moved per read when scanning or copying flash.
pub const FLASH_BLOCK_SIZE: usize = 256;

const ERASED: u8 = 0xFF;

fn classify(kind: NorFlashErrorKind, otherwise: FlashError) -> FotaError {
    let error = match kind {
        NorFlashErrorKind::NotAligned => FlashError::NotAligned,
        NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
        _ => otherwise,
    };
    FotaError::Flash(error)
}

pub fn read<F: NorFlash>(flash: &mut F, offset: u32, bytes: &mut [u8]) -> Result<(), FotaError> {
    flash
        .read(offset, bytes)
        .map_err(|e| classify(e.kind(), FlashError::ReadFailed))
}

pub fn write<F: NorFlash>(flash: &mut F, offset: u32, bytes: &[u8]) -> Result<(), FotaError> {
    flash
        .write(offset, bytes)
        .map_err(|e| classify(e.kind(), FlashError::WriteFailed))
}

pub fn erase<F: NorFlash>(flash: &mut F, from: u32, to: u32) -> Result<(), FotaError> {
    log::trace!("Erasing flash {:#x}..{:#x}", from, to);
    flash
        .erase(from, to)
        .map_err(|e| classify(e.kind(), FlashError::EraseFailed))
}

/// `length` rounded up to whole erase pages.
pub fn page_span<F: NorFlash>(length: u32) -> u32 {
    let page = F::ERASE_SIZE as u32;
    length.div_ceil(page) * page
}

/// CRC32 of `length` bytes at `offset`, zero padded to a word like every other
/// checksum in the protocol.
pub fn image_crc<F: NorFlash>(flash: &mut F, offset: u32, length: u32) -> Result<u32, FotaError> {
    let mut crc = ImageCrc::new();
    let mut block = [0u8; FLASH_BLOCK_SIZE];
    let mut done = 0u32;
    while done < length {
        let step = (length - done).min(FLASH_BLOCK_SIZE as u32) as usize;
        read(flash, offset + done, &mut block[..step])?;
        crc.update(&block[..step]);
        done += step as u32;
    }
    Ok(crc.finalize())
}

/// True if every byte in the range reads as erased.
pub fn is_blank<F: NorFlash>(flash: &mut F, offset: u32, length: u32) -> Result<bool, FotaError> {
    let mut block = [0u8; FLASH_BLOCK_SIZE];
    let mut done = 0u32;
    while done < length {
        let step = (length - done).min(FLASH_BLOCK_SIZE as u32) as usize;
        read(flash, offset + done, &mut block[..step])?;
        if block[..step].iter().any(|b| *b != ERASED) {
            return Ok(false);
        }
        done += step as u32;
    }
    Ok(true)
}

/// Copies `length` bytes from `source` to `destination` one erase page at a
/// time, erasing each destination page just before it is programmed.
pub fn copy_pages<F: NorFlash>(flash: &mut F, source: u32, destination: u32, length: u32) -> Result<(), FotaError> {
    let page = F::ERASE_SIZE as u32;
    let mut block = [0u8; FLASH_BLOCK_SIZE];
    let mut page_start = 0u32;

    while page_start < length {
        erase(flash, destination + page_start, destination + page_start + page)?;

        let page_end = (page_start + page).min(page_span::<F>(length));
        let mut offset = page_start;
        while offset < page_end {
            let step = (page_end - offset).min(FLASH_BLOCK_SIZE as u32) as usize;
            read(flash, source + offset, &mut block[..step])?;
            write(flash, destination + offset, &block[..step])?;
            offset += step as u32;
        }
        log::trace!("Copied page {:#x} -> {:#x}", source + page_start, destination + page_start);
        page_start += page;
    }
    Ok(())
}
