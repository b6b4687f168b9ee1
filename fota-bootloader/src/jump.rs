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

use cortex_m::peripheral::SCB;
use fota_core::FotaError;
use fota_core::jump::{Jump, JumpTarget};

use crate::layout::ACTIVE_OFFSET;

pub struct CortexMJump;

impl Jump for CortexMJump {
    fn jump(&mut self, target: JumpTarget) -> FotaError {
        match target {
            JumpTarget::Application => {
                let vector_table = embassy_rp::flash::FLASH_BASE as u32 + ACTIVE_OFFSET;
                log::info!("Booting application at {:#010x}", vector_table);
                unsafe { boot(vector_table) }
            }
            JumpTarget::Bootloader => SCB::sys_reset(),
            JumpTarget::VendorBootloader => {
                log::info!("Resetting into the ROM USB bootloader");
                #[allow(unused_unsafe)]
                unsafe {
                    embassy_rp::rom_data::reset_to_usb_boot(0, 0);
                }
                FotaError::BootloaderFailure
            }
        }
    }
}

/// Hands the core over to the image whose vector table is at `vector_table`.
///
/// # Safety
///
/// `vector_table` must hold a valid initial stack pointer and reset vector.
unsafe fn boot(vector_table: u32) -> ! {
    cortex_m::interrupt::disable();
    let mut p = unsafe { cortex_m::Peripherals::steal() };
    for icer in p.NVIC.icer.iter() {
        unsafe { icer.write(u32::MAX) };
    }
    for icpr in p.NVIC.icpr.iter() {
        unsafe { icpr.write(u32::MAX) };
    }
    unsafe {
        p.SCB.vtor.write(vector_table);
        cortex_m::asm::bootload(vector_table as *const u32)
    }
}
