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

//! Flash map of the part, as offsets from the start of flash.
//!
//! ```text
//! 0x000000  boot2 + bootloader     64 KiB
//! 0x010000  image record            4 KiB
//! 0x011000  active application    960 KiB
//! 0x101000  staging               960 KiB
//! 0x1F1000  unused
//! ```
//!
//! Applications must be linked with their vector table at `FLASH_BASE + ACTIVE_OFFSET`.

use fota_core::dfu::DfuConfig;

pub const FLASH_SIZE: usize = 2 * 1024 * 1024;

pub const IMAGE_RECORD_OFFSET: u32 = 0x0001_0000;
pub const ACTIVE_OFFSET: u32 = 0x0001_1000;
pub const STAGING_OFFSET: u32 = 0x0010_1000;
pub const REGION_SIZE: u32 = 0x000F_0000;

/// `None` answers updates addressed to any node.
pub const NODE_ID: Option<u8> = None;

pub const fn dfu_config() -> DfuConfig {
    DfuConfig {
        staging_offset: STAGING_OFFSET,
        active_offset: ACTIVE_OFFSET,
        region_size: REGION_SIZE,
        metadata_offset: Some(IMAGE_RECORD_OFFSET),
    }
}
