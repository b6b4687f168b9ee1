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

use circular_buffer::CircularBuffer;
use embedded_io::{ErrorKind, ErrorType, Read, Write};
use fota_core::datagram::builder::DatagramBuilder;
use fota_core::datagram::payload::{AckStatus, Acknowledgement, FIRMWARE_ID_SIZE};
use fota_core::datagram::{Datagram, DatagramKind};
use fota_core::packet::PACKET_SOF;
use fota_core::packet_manager::{Delivery, PacketManager, PacketOutcome};
use fota_core::{MAX_DATAGRAM_SIZE, PACKET_SERIALIZED_SIZE};

pub use fota_core::FotaError;
pub use util::{firmware_id_from_label, image_crc32};

/// Id carried by the metadata datagram, kept clear of the chunk indices.
pub const METADATA_DATAGRAM_ID: u32 = 0xFFFF_0000;
pub const JUMP_DATAGRAM_ID: u32 = 0xFFFF_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHandlerError {
    Fota(FotaError),
    InvalidOptions,
    EmptyFirmware,
    RxBufferNotEnoughSpace,
    UnexpectedDatagram(DatagramKind),
    NodeRejected { response_to: DatagramKind, error_code: u32 },
    RetriesExhausted,
    SessionEnded,
}

impl From<FotaError> for SessionHandlerError {
    fn from(err: FotaError) -> Self {
        SessionHandlerError::Fota(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub max_chunks: u32,
    pub current_chunk: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Node the datagrams are addressed to, `None` for any listener.
    pub target_node: Option<u8>,
    pub version: (u8, u8),
    pub firmware_id: [u8; FIRMWARE_ID_SIZE],
    /// Bytes per firmware chunk. At most one full datagram and a whole number of words.
    pub chunk_size: usize,
    /// Retransmissions allowed per datagram before the session gives up.
    pub max_retries: u8,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            target_node: None,
            version: (0, 0),
            firmware_id: [0u8; FIRMWARE_ID_SIZE],
            chunk_size: MAX_DATAGRAM_SIZE,
            max_retries: 5,
        }
    }
}

impl LoaderOptions {
    fn is_valid(&self) -> bool {
        self.chunk_size > 0 && self.chunk_size <= MAX_DATAGRAM_SIZE && self.chunk_size % 4 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostSessionState {
    Start,
    WaitingMetadataAck,
    WaitingChunkAck(u32),
    Done,
}

/// Incoming bytes feed the packet manager, outgoing frames are captured for the caller to send.
struct SessionLink<const BUFFER_SIZE: usize> {
    rx: CircularBuffer<BUFFER_SIZE, u8>,
    tx: Vec<u8>,
}

impl<const BUFFER_SIZE: usize> SessionLink<BUFFER_SIZE> {
    /// Drops buffered bytes ahead of the next start marker.
    fn discard_until_start(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(byte) = self.rx.front() {
            if *byte == PACKET_SOF {
                break;
            }
            self.rx.pop_front();
            dropped += 1;
        }
        dropped
    }
}

impl<const BUFFER_SIZE: usize> ErrorType for SessionLink<BUFFER_SIZE> {
    type Error = ErrorKind;
}

impl<const BUFFER_SIZE: usize> Read for SessionLink<BUFFER_SIZE> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorKind> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.rx.is_empty() {
            return Err(ErrorKind::TimedOut);
        }
        let mut count = 0;
        while count < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl<const BUFFER_SIZE: usize> Write for SessionLink<BUFFER_SIZE> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), ErrorKind> {
        Ok(())
    }
}

pub struct FotaHostFirmwareLoader<const BUFFER_SIZE: usize> {
    firmware_bytes: Vec<u8>,
    options: LoaderOptions,
    session_state: HostSessionState,
    packet_manager: PacketManager<SessionLink<BUFFER_SIZE>>,
    tx_message_buffer: Vec<u8>,
    tx_valid_bytes_size: usize,
    retries: u8,
    download_progress: Progress,
}

impl<const BUFFER_SIZE: usize> FotaHostFirmwareLoader<BUFFER_SIZE> {
    pub fn new(firmware_bytes: Vec<u8>, options: LoaderOptions) -> Result<Self, SessionHandlerError> {
        if !options.is_valid() {
            return Err(SessionHandlerError::InvalidOptions);
        }
        if firmware_bytes.is_empty() {
            return Err(SessionHandlerError::EmptyFirmware);
        }
        if u32::try_from(firmware_bytes.len()).is_err() {
            return Err(FotaError::BinaryOversized.into());
        }
        let max_chunks = firmware_bytes.len().div_ceil(options.chunk_size) as u32;

        Ok(Self {
            firmware_bytes,
            options,
            session_state: HostSessionState::Start,
            packet_manager: PacketManager::new(SessionLink {
                rx: CircularBuffer::<BUFFER_SIZE, u8>::new(),
                tx: Vec::new(),
            }),
            tx_message_buffer: Vec::new(),
            tx_valid_bytes_size: 0,
            retries: 0,
            download_progress: Progress {
                max_chunks,
                current_chunk: 0,
            },
        })
    }

    /// Feeds bytes received from the node into the session and advances it.
    ///
    /// The first call, normally with no bytes, queues the metadata datagram.
    /// Whatever the session wants sent next is collected with
    /// [`Self::get_bytes_to_send`].
    pub fn session_handler(
        mut session: FotaHostFirmwareLoader<BUFFER_SIZE>,
        incoming_bytes: &[u8],
    ) -> Result<FotaHostFirmwareLoader<BUFFER_SIZE>, SessionHandlerError> {
        let link = session.packet_manager.transport_mut();
        if incoming_bytes.len() + link.rx.len() > link.rx.capacity() {
            return Err(SessionHandlerError::RxBufferNotEnoughSpace);
        }
        log::trace!("Called with {} new bytes, {} bytes in buffer", incoming_bytes.len(), link.rx.len());
        link.rx.extend_from_slice(incoming_bytes);

        log::trace!("Session state: {:?}", session.session_state);

        match session.session_state {
            HostSessionState::Start => {
                let image_crc = util::image_crc32(&session.firmware_bytes);
                log::trace!(
                    "Firmware image is {} bytes, CRC32 {:#010x}",
                    session.firmware_bytes.len(),
                    image_crc
                );
                let (major, minor) = session.options.version;
                let metadata = DatagramBuilder::new()
                    .target_node(session.options.target_node)
                    .firmware_metadata()
                    .binary_size(session.firmware_bytes.len() as u32)
                    .expected_crc32(image_crc)
                    .version(major, minor)
                    .firmware_id(&session.options.firmware_id)
                    .build(METADATA_DATAGRAM_ID)?;
                session.queue(&metadata)?;
                session.session_state = HostSessionState::WaitingMetadataAck;
                log::trace!("Generated metadata datagram, waiting for acknowledgement");
            }
            HostSessionState::Done => {
                return Err(SessionHandlerError::SessionEnded);
            }
            HostSessionState::WaitingMetadataAck | HostSessionState::WaitingChunkAck(_) => {
                // a partial frame stays buffered until the rest of it arrives
                loop {
                    let link = session.packet_manager.transport_mut();
                    let skipped = link.discard_until_start();
                    if skipped > 0 {
                        log::debug!("Dropped {} bytes ahead of a start marker", skipped);
                    }
                    if link.rx.len() < PACKET_SERIALIZED_SIZE {
                        break;
                    }
                    if let Some(ack) = session.receive_acknowledgement()? {
                        session.handle_acknowledgement(ack)?;
                    }
                    if session.session_state == HostSessionState::Done {
                        break;
                    }
                }
            }
        }
        log::trace!("Session actions completed");

        Ok(session)
    }

    /// Called when the node has not answered in time; queues the outstanding datagram again.
    pub fn on_timeout(
        mut session: FotaHostFirmwareLoader<BUFFER_SIZE>,
    ) -> Result<FotaHostFirmwareLoader<BUFFER_SIZE>, SessionHandlerError> {
        match session.session_state {
            HostSessionState::Start | HostSessionState::Done => Ok(session),
            HostSessionState::WaitingMetadataAck | HostSessionState::WaitingChunkAck(_) => {
                log::debug!("Timed out in {:?}", session.session_state);
                session.packet_manager.transport_mut().rx.clear();
                session.retransmit()?;
                Ok(session)
            }
        }
    }

    pub fn get_bytes_to_send(session: &mut FotaHostFirmwareLoader<BUFFER_SIZE>) -> Option<&[u8]> {
        if session.tx_valid_bytes_size > 0 {
            log::trace!("Returning {} bytes to send", session.tx_valid_bytes_size);
            let message_size = session.tx_valid_bytes_size;
            session.tx_valid_bytes_size = 0;
            return Some(&session.tx_message_buffer[..message_size]);
        }
        log::trace!("Nothing to send");
        None
    }

    pub fn get_chunk_progress(session: &FotaHostFirmwareLoader<BUFFER_SIZE>) -> Progress {
        session.download_progress
    }

    /// True once the jump request has been queued. The node does not answer a jump that succeeds.
    pub fn is_session_ended(session: &FotaHostFirmwareLoader<BUFFER_SIZE>) -> bool {
        matches!(session.session_state, HostSessionState::Done)
    }

    fn queue(&mut self, datagram: &Datagram) -> Result<(), SessionHandlerError> {
        self.packet_manager.transport_mut().tx.clear();
        self.packet_manager.send_datagram(datagram)?;
        self.tx_message_buffer = std::mem::take(&mut self.packet_manager.transport_mut().tx);
        self.tx_valid_bytes_size = self.tx_message_buffer.len();
        log::trace!(
            "Queued {:?} datagram {} as {} bytes",
            datagram.kind(),
            datagram.datagram_id(),
            self.tx_valid_bytes_size
        );
        Ok(())
    }

    fn queue_chunk(&mut self, chunk_index: u32) -> Result<(), SessionHandlerError> {
        let start = chunk_index as usize * self.options.chunk_size;
        let end = usize::min(start + self.options.chunk_size, self.firmware_bytes.len());
        let chunk = DatagramBuilder::new()
            .target_node(self.options.target_node)
            .firmware_chunk(&self.firmware_bytes[start..end])
            .build(chunk_index)?;
        self.queue(&chunk)?;
        self.session_state = HostSessionState::WaitingChunkAck(chunk_index);
        Ok(())
    }

    fn retransmit(&mut self) -> Result<(), SessionHandlerError> {
        self.retries += 1;
        if self.retries > self.options.max_retries {
            log::error!("Giving up after {} retries", self.options.max_retries);
            return Err(SessionHandlerError::RetriesExhausted);
        }
        log::debug!("Retransmitting, attempt {}", self.retries);
        self.tx_valid_bytes_size = self.tx_message_buffer.len();
        Ok(())
    }

    /// Reads one frame; returns the acknowledgement it completed, if any.
    fn receive_acknowledgement(&mut self) -> Result<Option<Acknowledgement>, SessionHandlerError> {
        let mut ack = None;
        let mut collect = |datagram: &Datagram| -> Result<(), FotaError> {
            if datagram.kind() != DatagramKind::Acknowledgement {
                return Err(FotaError::InvalidDatagram);
            }
            ack = Some(Acknowledgement::decode(datagram.data())?);
            Ok(())
        };

        match self.packet_manager.process(&mut collect) {
            Ok(PacketOutcome::Delivered(Delivery {
                kind,
                result: Err(_),
                ..
            })) => {
                log::trace!("Unexpected {:?} datagram from node", kind);
                Err(SessionHandlerError::UnexpectedDatagram(kind))
            }
            Ok(PacketOutcome::Discarded(reason)) => {
                log::debug!("Discarded frame: {:?}", reason);
                Ok(None)
            }
            Ok(_) => Ok(ack),
            Err(e) => {
                log::debug!("Packet rejected: {}", e);
                Ok(None)
            }
        }
    }

    fn handle_acknowledgement(&mut self, ack: Acknowledgement) -> Result<(), SessionHandlerError> {
        let (expected_kind, expected_id) = match self.session_state {
            HostSessionState::WaitingMetadataAck => (DatagramKind::FirmwareMetadata, METADATA_DATAGRAM_ID),
            HostSessionState::WaitingChunkAck(index) => (DatagramKind::FirmwareChunk, index),
            HostSessionState::Start | HostSessionState::Done => return Ok(()),
        };
        if ack.response_to != expected_kind || ack.response_to_id != expected_id {
            log::debug!("Ignoring stale acknowledgement for {:?} {}", ack.response_to, ack.response_to_id);
            return Ok(());
        }

        match ack.status {
            AckStatus::Ack => self.advance(),
            AckStatus::Nack => {
                let error = ack.error();
                log::warn!("Node refused {:?} {}: {:?}", expected_kind, expected_id, error);
                if self.retries > 0 && self.already_applied(error) {
                    log::debug!("Earlier copy was applied, carrying on");
                    return self.advance();
                }
                match error {
                    Some(
                        FotaError::CrcMismatch
                        | FotaError::InvalidPacket
                        | FotaError::InternalError
                        | FotaError::Timeout
                        | FotaError::TransportFailure,
                    ) => self.retransmit(),
                    _ => Err(SessionHandlerError::NodeRejected {
                        response_to: expected_kind,
                        error_code: ack.error_code,
                    }),
                }
            }
        }
    }

    /// A retransmitted datagram refused in this way means its first copy got through and only the
    /// acknowledgement was lost.
    fn already_applied(&self, error: Option<FotaError>) -> bool {
        matches!(
            (self.session_state, error),
            (HostSessionState::WaitingMetadataAck, Some(FotaError::BootloaderInvalidState))
                | (
                    HostSessionState::WaitingChunkAck(_),
                    Some(FotaError::SequenceOutOfOrder | FotaError::BootloaderInvalidState)
                )
        )
    }

    fn advance(&mut self) -> Result<(), SessionHandlerError> {
        self.retries = 0;
        match self.session_state {
            HostSessionState::WaitingMetadataAck => {
                log::trace!("Metadata accepted, starting chunk transfer");
                self.queue_chunk(0)
            }
            HostSessionState::WaitingChunkAck(index) => {
                self.download_progress.current_chunk = index + 1;
                if index + 1 < self.download_progress.max_chunks {
                    self.queue_chunk(index + 1)
                } else {
                    log::trace!("All {} chunks accepted, requesting jump", self.download_progress.max_chunks);
                    let jump = DatagramBuilder::new()
                        .target_node(self.options.target_node)
                        .jump_to_app()
                        .build(JUMP_DATAGRAM_ID)?;
                    self.queue(&jump)?;
                    self.session_state = HostSessionState::Done;
                    Ok(())
                }
            }
            HostSessionState::Start | HostSessionState::Done => Ok(()),
        }
    }
}
