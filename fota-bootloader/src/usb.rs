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

use embassy_executor::Spawner;
use embassy_rp::peripherals::USB;
use embassy_rp::usb::{Driver, InterruptHandler};
use embassy_rp::{Peri, bind_interrupts};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pipe::Pipe;
use embassy_usb::class::cdc_acm::{CdcAcmClass, Receiver, Sender, State};
use embassy_usb::driver::EndpointError;
use embedded_io::{ErrorKind, ErrorType, Write};
use fota_core::network::NetworkProducer;
use static_cell::StaticCell;

bind_interrupts!(struct UsbIrqs {
    USBCTRL_IRQ => InterruptHandler<USB>;
});

const MAX_PACKET_SIZE: u8 = 64;

/// Room for a full datagram of frames plus slack.
pub const NETWORK_BUFFER_SIZE: usize = 4096;
const TX_PIPE_SIZE: usize = 1024;

pub type TxPipe = Pipe<CriticalSectionRawMutex, TX_PIPE_SIZE>;

type UsbDriver = Driver<'static, USB>;

/// Brings up the CDC-ACM serial port. Received bytes go to `producer`,
/// bytes written to `tx_pipe` go to the host.
pub fn start(
    usb_peripheral: Peri<'static, USB>,
    spawner: Spawner,
    producer: NetworkProducer<'static, NETWORK_BUFFER_SIZE>,
    tx_pipe: &'static TxPipe,
) {
    let driver = Driver::new(usb_peripheral, UsbIrqs);

    let config = {
        let mut config = embassy_usb::Config::new(0x1209, 0x4005);
        config.manufacturer = Some("FOTA");
        config.product = Some("FOTA Bootloader");
        config.serial_number = Some("00000001");
        config.max_power = 100;
        config.max_packet_size_0 = MAX_PACKET_SIZE;
        config
    };

    let mut builder = {
        static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
        static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
        static CONTROL_BUF: StaticCell<[u8; 64]> = StaticCell::new();

        embassy_usb::Builder::new(
            driver,
            config,
            CONFIG_DESCRIPTOR.init([0; 256]),
            BOS_DESCRIPTOR.init([0; 256]),
            &mut [], // no msos descriptors
            CONTROL_BUF.init([0; 64]),
        )
    };

    static STATE: StaticCell<State> = StaticCell::new();
    let class = CdcAcmClass::new(&mut builder, STATE.init(State::new()), MAX_PACKET_SIZE as u16);
    let usb = builder.build();
    let (sender, receiver) = class.split();

    if let Err(e) = spawner.spawn(usb_task(usb)) {
        log::error!("USB task not started: {:?}", e);
    }
    if let Err(e) = spawner.spawn(usb_rx_task(receiver, producer)) {
        log::error!("USB rx task not started: {:?}", e);
    }
    if let Err(e) = spawner.spawn(usb_tx_task(sender, tx_pipe)) {
        log::error!("USB tx task not started: {:?}", e);
    }
}

#[embassy_executor::task]
async fn usb_task(mut usb: embassy_usb::UsbDevice<'static, UsbDriver>) {
    usb.run().await;
}

#[embassy_executor::task]
async fn usb_rx_task(
    mut receiver: Receiver<'static, UsbDriver>,
    mut producer: NetworkProducer<'static, NETWORK_BUFFER_SIZE>,
) {
    let mut packet = [0u8; MAX_PACKET_SIZE as usize];
    loop {
        receiver.wait_connection().await;
        log::info!("Host connected");
        loop {
            match receiver.read_packet(&mut packet).await {
                // overflow is logged by the producer and caught by the frame CRC
                Ok(count) => {
                    let _ = producer.push_slice(&packet[..count]);
                }
                Err(EndpointError::BufferOverflow) => log::warn!("USB packet larger than buffer"),
                Err(EndpointError::Disabled) => break,
            }
        }
        log::info!("Host disconnected");
    }
}

#[embassy_executor::task]
async fn usb_tx_task(mut sender: Sender<'static, UsbDriver>, tx_pipe: &'static TxPipe) {
    let mut packet = [0u8; MAX_PACKET_SIZE as usize];
    loop {
        sender.wait_connection().await;
        loop {
            let count = tx_pipe.read(&mut packet).await;
            if let Err(EndpointError::Disabled) = sender.write_packet(&packet[..count]).await {
                break;
            }
        }
    }
}

/// Blocking writer for the packet manager. Never waits, fails if the pipe is full.
pub struct UsbWriter {
    tx_pipe: &'static TxPipe,
}

impl UsbWriter {
    pub fn new(tx_pipe: &'static TxPipe) -> Self {
        Self { tx_pipe }
    }
}

impl ErrorType for UsbWriter {
    type Error = ErrorKind;
}

impl Write for UsbWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx_pipe.try_write(buf).map_err(|_| ErrorKind::OutOfMemory)
    }

    fn flush(&mut self) -> Result<(), ErrorKind> {
        Ok(())
    }
}
