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

use crate::dfu::record::ImageRecord;
use crate::error::FotaError;
use crate::flash::FLASH_BLOCK_SIZE;

/// Largest flash write granularity the DFU can pad a final chunk out to.
pub const MAX_WRITE_SIZE: usize = 16;

/// Flash layout used by the DFU. All offsets are relative to the start of the
/// flash device and must sit on erase page boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DfuConfig {
    /// Where incoming images are written before they are checked
    pub staging_offset: u32,
    /// Where the application runs from
    pub active_offset: u32,
    /// Size of each of the staging and active regions
    pub region_size: u32,
    /// Page holding the record of the installed image, if kept
    pub metadata_offset: Option<u32>,
}

impl DfuConfig {
    pub(crate) fn validate<F: NorFlash>(&self, flash: &F) -> Result<(), FotaError> {
        let page = F::ERASE_SIZE as u64;
        let capacity = flash.capacity() as u64;
        let write_size = F::WRITE_SIZE;

        if write_size > MAX_WRITE_SIZE
            || FLASH_BLOCK_SIZE % write_size != 0
            || ImageRecord::ENCODED_SIZE % write_size != 0
        {
            log::error!("Flash write size {} not supported", write_size);
            return Err(FotaError::InvalidArgs);
        }

        let region = self.region_size as u64;
        if region == 0 || region % page != 0 {
            return Err(FotaError::InvalidArgs);
        }

        let staging = Span::new(self.staging_offset as u64, region);
        let active = Span::new(self.active_offset as u64, region);
        let mut spans = [Some(staging), Some(active), None];
        if let Some(offset) = self.metadata_offset {
            spans[2] = Some(Span::new(offset as u64, page));
        }

        for span in spans.iter().flatten() {
            if span.start % page != 0 || span.end > capacity {
                log::error!("Flash region {:#x}..{:#x} misaligned or out of range", span.start, span.end);
                return Err(FotaError::InvalidArgs);
            }
        }

        for (index, first) in spans.iter().flatten().enumerate() {
            if spans.iter().flatten().skip(index + 1).any(|second| first.overlaps(second)) {
                log::error!("Flash regions overlap");
                return Err(FotaError::InvalidArgs);
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Span {
    start: u64,
    end: u64,
}

impl Span {
    fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            end: start + length,
        }
    }

    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}
