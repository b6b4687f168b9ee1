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

mod util;

use fota_host_core::{FotaHostFirmwareLoader, LoaderOptions, SessionHandlerError, firmware_id_from_label};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::time::Duration;

const RX_BUFFER_SIZE: usize = 4096;

/// How long to wait for the node to answer before resending
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

type Loader = FotaHostFirmwareLoader<RX_BUFFER_SIZE>;

fn session_error(err: SessionHandlerError) -> IoError {
    IoError::new(ErrorKind::Other, format!("Update session failed: {:?}", err))
}

fn main() -> IoResult<()> {
    let args: Vec<String> = std::env::args().collect();
    let log_level = util::parse_log_level(&args);

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    log::info!("FOTA Firmware Loader");
    log::info!("==================================\n");

    let firmware_path = util::extract_firmware_file_path(&args)?;
    let firmware_bytes = util::read_binary_file(&firmware_path)?;
    log::info!("Firmware: {} ({} bytes)", firmware_path, firmware_bytes.len());

    log::info!("Available serial ports:");
    let ports = serialport::available_ports().map_err(|e| IoError::new(ErrorKind::Other, e.to_string()))?;
    for port in &ports {
        log::info!("  - {}", port.port_name);
    }

    let port_name = match util::parse_port(&args) {
        Some(port) => port,
        None => match ports.first() {
            Some(port) => port.port_name.clone(),
            None => {
                log::error!("No serial ports found!");
                return Ok(());
            }
        },
    };
    let baud_rate = util::parse_baud(&args)?;
    let node_id = util::parse_node_id(&args)?;

    log::info!("Connecting to: {}", port_name);
    let mut serial = serialport::new(&port_name, baud_rate)
        .timeout(RESPONSE_TIMEOUT)
        .open()
        .map_err(|e| IoError::new(ErrorKind::ConnectionRefused, e.to_string()))?;

    log::info!("Connected successfully!");
    log::info!("Baud rate: {}", baud_rate);
    match node_id {
        Some(id) => log::info!("Target node: {}\n", id),
        None => log::info!("Target node: any\n"),
    }

    // Give device time to initialize
    std::thread::sleep(Duration::from_millis(100));

    let options = LoaderOptions {
        target_node: node_id,
        firmware_id: firmware_id_from_label(&util::firmware_label(&firmware_path)),
        ..LoaderOptions::default()
    };
    let session = Loader::new(firmware_bytes, options).map_err(session_error)?;
    let mut session = Loader::session_handler(session, &[]).map_err(session_error)?;

    let progress = ProgressBar::new(Loader::get_chunk_progress(&session).max_chunks as u64);
    progress.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} chunks {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );

    let mut rx_buffer = [0u8; 512];
    loop {
        if let Some(bytes) = Loader::get_bytes_to_send(&mut session) {
            serial.write_all(bytes)?;
            serial.flush()?;
        }
        if Loader::is_session_ended(&session) {
            break;
        }

        session = match serial.read(&mut rx_buffer) {
            Ok(count) => Loader::session_handler(session, &rx_buffer[..count]),
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                log::debug!("No response in {:?}, resending", RESPONSE_TIMEOUT);
                Loader::on_timeout(session)
            }
            Err(e) => {
                progress.abandon_with_message("link lost");
                return Err(e);
            }
        }
        .map_err(|e| {
            progress.abandon_with_message("failed");
            session_error(e)
        })?;
        progress.set_position(Loader::get_chunk_progress(&session).current_chunk as u64);
    }

    progress.finish_with_message("done");
    log::info!("Image sent, node is starting the new firmware");
    Ok(())
}
