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

#![no_std]
#![no_main]

mod jump;
mod layout;
#[cfg(feature = "defmt")]
mod logging;
mod usb;

use cortex_m::peripheral::SCB;
use cortex_m_rt::exception;
#[cfg(feature = "defmt")]
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::yield_now;
use embassy_rp::flash::Flash;
use embassy_time::{Instant, Timer};
use fota_core::dfu::Dfu;
use fota_core::network::{Clock, Link, NetworkBuffer};
use fota_core::node::{FotaNode, NodeConfig};
use fota_core::packet::PACKET_SOF;
use fota_core::packet_manager::PacketManager;
use fota_core::{FotaError, PACKET_SERIALIZED_SIZE, SESSION_INACTIVITY_TIMEOUT_MS, TRANSPORT_TIMEOUT_MS};
use static_cell::StaticCell;

use crate::jump::CortexMJump;
use crate::layout::FLASH_SIZE;
use crate::usb::{NETWORK_BUFFER_SIZE, TxPipe, UsbWriter};

struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

static NETWORK: StaticCell<NetworkBuffer<NETWORK_BUFFER_SIZE>> = StaticCell::new();
static TX_PIPE: TxPipe = TxPipe::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) -> ! {
    #[cfg(feature = "defmt")]
    logging::init(log::LevelFilter::Debug);

    let p = embassy_rp::init(Default::default());

    // Uncomment this if you are debugging the bootloader with debugger/RTT attached,
    // as it prevents a hard fault when accessing flash 'too early' after boot.
    // for i in 0..10000000 {
    //     cortex_m::asm::nop();
    // }

    log::info!("Bootloader starting");

    let flash = Flash::<_, _, FLASH_SIZE>::new_blocking(p.FLASH);
    let mut dfu = Dfu::new(flash, CortexMJump);
    if let Err(e) = dfu.init(layout::dfu_config()) {
        log::error!("Flash layout rejected: {}", e);
        halt();
    }

    // without an intact application there is nothing to fall back to
    let inactivity_timeout_ms = match dfu.check_installed() {
        Ok(()) => SESSION_INACTIVITY_TIMEOUT_MS,
        Err(e) => {
            log::warn!("No usable application ({}), waiting for an update", e);
            u64::MAX
        }
    };

    let (producer, reader) = NETWORK.init(NetworkBuffer::new()).split(EmbassyClock);
    usb::start(p.USB, spawner, producer, &TX_PIPE);

    let transport = Link {
        reader: reader.with_timeout(TRANSPORT_TIMEOUT_MS),
        writer: UsbWriter::new(&TX_PIPE),
    };
    let mut node = FotaNode::new(
        PacketManager::new(transport),
        dfu,
        NodeConfig {
            node_id: layout::NODE_ID,
            inactivity_timeout_ms,
        },
    );

    loop {
        let now_ms = Instant::now().as_millis();
        // reads block the executor, so only poll once a whole frame from its start marker is buffered
        let reader = &mut node.packet_manager_mut().transport_mut().reader;
        let skipped = reader.discard_until(PACKET_SOF);
        if skipped > 0 {
            log::debug!("Dropped {} bytes ahead of a start marker", skipped);
        }
        let frame_buffered = reader.available() >= PACKET_SERIALIZED_SIZE;
        let result = if frame_buffered {
            node.poll(now_ms).map(|event| log::trace!("{:?}", event))
        } else {
            node.check_inactivity(now_ms)
        };

        match result {
            Ok(()) => {}
            Err(e @ (FotaError::BootloaderFailure | FotaError::TransportFailure)) => {
                log::error!("Update loop stopped: {}", e);
                SCB::sys_reset();
            }
            // the node has stopped its timer and carries on waiting
            Err(e) => log::error!("Fail safe jump refused: {}", e),
        }

        if frame_buffered {
            yield_now().await;
        } else {
            Timer::after_millis(1).await;
        }
    }
}

fn halt() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

#[unsafe(no_mangle)]
#[cfg_attr(target_os = "none", unsafe(link_section = ".HardFault.user"))]
unsafe extern "C" fn HardFault() {
    SCB::sys_reset();
}

#[exception]
unsafe fn DefaultHandler(_: i16) -> ! {
    const SCB_ICSR: *const u32 = 0xE000_ED04 as *const u32;
    let irqn = unsafe { core::ptr::read_volatile(SCB_ICSR) } as u8 as i16 - 16;

    panic!("DefaultHandler #{:?}", irqn);
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    cortex_m::asm::udf();
}
