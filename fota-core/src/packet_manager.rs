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

use embedded_io::{Error as _, ErrorKind, Read, Write};

use crate::PACKET_SERIALIZED_SIZE;
use crate::datagram::{Datagram, DatagramKind};
use crate::error::FotaError;
use crate::packet::{PACKET_SOF, Packet, PacketKind};

/// Receives every datagram that arrives complete and passes its CRC32.
pub trait DatagramHandler {
    fn on_datagram_complete(&mut self, datagram: &Datagram) -> Result<(), FotaError>;
}

impl<F> DatagramHandler for F
where
    F: FnMut(&Datagram) -> Result<(), FotaError>,
{
    fn on_datagram_complete(&mut self, datagram: &Datagram) -> Result<(), FotaError> {
        self(datagram)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Markers, kind tag or length field were invalid
    Malformed,
    CrcMismatch,
    /// Well formed, but not a kind the reassembler takes
    Unrouted,
}

/// A datagram handed to the handler, with the handler's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub kind: DatagramKind,
    pub datagram_id: u32,
    pub result: Result<(), FotaError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// No whole frame was available
    Idle,
    Discarded(DiscardReason),
    /// Packet applied, its datagram is still incomplete
    Accepted,
    /// Datagram completed but failed its CRC32 and was dropped
    VerificationFailed { kind: DatagramKind, datagram_id: u32 },
    Delivered(Delivery),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_received: u32,
    pub frames_malformed: u32,
    pub frames_crc_failed: u32,
    pub frames_unrouted: u32,
    pub partial_frames: u32,
    /// Bytes thrown away while looking for a start marker
    pub bytes_skipped: u32,
    pub packets_rejected: u32,
    pub datagrams_delivered: u32,
    pub datagrams_failed_verification: u32,
}

/// Turns a byte stream into verified datagrams.
///
/// Each call to [`PacketManager::process`] handles at most one frame. Nothing
/// is carried between calls except the datagram being reassembled, so a frame
/// cut short by a timeout is simply lost and the sender's retransmission fills
/// the gap.
pub struct PacketManager<T> {
    transport: T,
    frame: [u8; PACKET_SERIALIZED_SIZE],
    datagram: Datagram,
    stats: LinkStats,
}

impl<T: Read + Write> PacketManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            frame: [0u8; PACKET_SERIALIZED_SIZE],
            datagram: Datagram::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// The datagram currently being reassembled.
    pub fn datagram(&self) -> &Datagram {
        &self.datagram
    }

    /// Reads and handles one frame.
    ///
    /// Malformed and corrupted frames are dropped without touching the
    /// datagram in progress. Once a datagram completes and verifies, `handler`
    /// is called exactly once and the reassembler starts afresh.
    ///
    /// # Errors
    ///
    /// - `InternalError`: the reassembler rejected the packet (duplicate,
    ///   wrong datagram, bad sequence)
    /// - `InvalidPacket`, `ResourceExhausted`: header packet unusable
    /// - `TransportFailure`: the transport failed other than by timing out
    pub fn process<H: DatagramHandler + ?Sized>(&mut self, handler: &mut H) -> Result<PacketOutcome, FotaError> {
        if !self.read_frame()? {
            return Ok(PacketOutcome::Idle);
        }
        self.stats.frames_received += 1;

        let packet = match Packet::deserialize(&self.frame) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.frames_malformed += 1;
                log::debug!("Dropping malformed frame: {}", e);
                return Ok(PacketOutcome::Discarded(DiscardReason::Malformed));
            }
        };
        if packet.verify_crc().is_err() {
            self.stats.frames_crc_failed += 1;
            log::debug!(
                "Dropping packet {}/{} with bad crc",
                packet.datagram_id,
                packet.sequence
            );
            return Ok(PacketOutcome::Discarded(DiscardReason::CrcMismatch));
        }

        let routed = match packet.kind {
            PacketKind::Header if packet.sequence == 0 => self.datagram.process_header_packet(&packet),
            PacketKind::Data => self.datagram.process_data_packet(&packet),
            kind => {
                self.stats.frames_unrouted += 1;
                log::debug!("Ignoring {:?} packet", kind);
                return Ok(PacketOutcome::Discarded(DiscardReason::Unrouted));
            }
        };
        if let Err(e) = routed {
            self.stats.packets_rejected += 1;
            log::debug!(
                "Packet {}/{} rejected: {}",
                packet.datagram_id,
                packet.sequence,
                e
            );
            return Err(e);
        }

        if !self.datagram.is_complete() {
            return Ok(PacketOutcome::Accepted);
        }

        let kind = self.datagram.kind();
        let datagram_id = self.datagram.datagram_id();
        if let Err(e) = self.datagram.verify() {
            self.stats.datagrams_failed_verification += 1;
            log::error!("Datagram {} failed verification: {}", datagram_id, e);
            self.datagram.reset();
            return Ok(PacketOutcome::VerificationFailed { kind, datagram_id });
        }

        log::debug!("Datagram {} ({:?}) complete", datagram_id, kind);
        let result = handler.on_datagram_complete(&self.datagram);
        self.datagram.reset();
        self.stats.datagrams_delivered += 1;

        Ok(PacketOutcome::Delivered(Delivery {
            kind,
            datagram_id,
            result,
        }))
    }

    /// Fragments a datagram and writes every frame to the transport.
    pub fn send_datagram(&mut self, datagram: &Datagram) -> Result<(), FotaError> {
        let mut frame = [0u8; PACKET_SERIALIZED_SIZE];
        for sequence in 0..datagram.packet_count() {
            datagram.packet(sequence)?.serialize(&mut frame)?;
            self.transport.write_all(&frame).map_err(|e| {
                log::warn!("Transport write failed: {:?}", e.kind());
                FotaError::TransportFailure
            })?;
        }
        self.transport.flush().map_err(|_| FotaError::TransportFailure)?;
        log::trace!(
            "Sent datagram {} in {} packets",
            datagram.datagram_id(),
            datagram.packet_count()
        );
        Ok(())
    }

    /// Fills `self.frame` with one frame starting at a start marker. Returns
    /// false if the stream ran dry first.
    fn read_frame(&mut self) -> Result<bool, FotaError> {
        let mut byte = [0u8; 1];
        loop {
            match self.transport.read(&mut byte) {
                Ok(0) => return Ok(false),
                Ok(_) if byte[0] == PACKET_SOF => break,
                Ok(_) => self.stats.bytes_skipped += 1,
                Err(e) => return Self::read_failure(e.kind()),
            }
        }

        self.frame[0] = PACKET_SOF;
        let mut filled = 1;
        while filled < PACKET_SERIALIZED_SIZE {
            match self.transport.read(&mut self.frame[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Self::read_failure(e.kind()),
            }
        }

        if filled < PACKET_SERIALIZED_SIZE {
            self.stats.partial_frames += 1;
            log::debug!("Partial frame of {} bytes dropped", filled);
            return Ok(false);
        }
        Ok(true)
    }

    fn read_failure(kind: ErrorKind) -> Result<bool, FotaError> {
        if kind == ErrorKind::TimedOut {
            Ok(false)
        } else {
            log::warn!("Transport read failed: {:?}", kind);
            Err(FotaError::TransportFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::builder::DatagramBuilder;
    use crate::sim::LoopbackTransport;

    type Link = LoopbackTransport<8192>;

    fn frames_of(datagram: &Datagram) -> Vec<[u8; PACKET_SERIALIZED_SIZE]> {
        (0..datagram.packet_count())
            .map(|i| {
                let mut frame = [0u8; PACKET_SERIALIZED_SIZE];
                datagram.packet(i).unwrap().serialize(&mut frame).unwrap();
                frame
            })
            .collect()
    }

    fn sample(id: u32, len: usize) -> Datagram {
        let data: Vec<u8> = (0..len).map(|i| (i * 3) as u8).collect();
        DatagramBuilder::new().firmware_chunk(&data).build(id).unwrap()
    }

    /// Drives `process` until the transport is drained, collecting deliveries.
    fn pump(manager: &mut PacketManager<Link>, delivered: &mut Vec<(u32, Vec<u8>)>) -> Vec<PacketOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let mut handler = |d: &Datagram| -> Result<(), FotaError> {
                delivered.push((d.datagram_id(), d.data().to_vec()));
                Ok(())
            };
            let outcome = manager.process(&mut handler).unwrap();
            if outcome == PacketOutcome::Idle {
                return outcomes;
            }
            outcomes.push(outcome);
        }
    }

    #[test]
    fn delivers_datagram_exactly_once() {
        let datagram = sample(1, 300);
        let mut manager = PacketManager::new(Link::new());
        for frame in frames_of(&datagram) {
            manager.transport_mut().feed(&frame);
        }

        let mut delivered = Vec::new();
        let outcomes = pump(&mut manager, &mut delivered);

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, 1);
        assert_eq!(delivered[0].1, datagram.data());
        assert_eq!(outcomes.iter().filter(|o| matches!(o, PacketOutcome::Delivered(_))).count(), 1);
        assert_eq!(manager.stats().datagrams_delivered, 1);
        assert!(!manager.datagram().has_header());
    }

    #[test]
    fn corrupted_packet_is_dropped_then_retransmission_completes() {
        let datagram = sample(2, 256);
        let frames = frames_of(&datagram);
        let mut manager = PacketManager::new(Link::new());

        let mut corrupted = frames[1];
        corrupted[20] ^= 0x01;
        manager.transport_mut().feed(&frames[0]);
        manager.transport_mut().feed(&corrupted);
        manager.transport_mut().feed(&frames[2]);

        let mut delivered = Vec::new();
        let outcomes = pump(&mut manager, &mut delivered);
        assert!(delivered.is_empty());
        assert!(outcomes.contains(&PacketOutcome::Discarded(DiscardReason::CrcMismatch)));

        manager.transport_mut().feed(&frames[1]);
        pump(&mut manager, &mut delivered);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, datagram.data());
    }

    #[test]
    fn partial_frame_is_ignored() {
        let datagram = sample(3, 10);
        let frames = frames_of(&datagram);
        let mut manager = PacketManager::new(Link::new());
        manager.transport_mut().feed(&frames[0][..70]);

        let mut never = |_: &Datagram| -> Result<(), FotaError> { panic!("nothing should be delivered") };
        assert_eq!(manager.process(&mut never), Ok(PacketOutcome::Idle));
        assert_eq!(manager.stats().partial_frames, 1);
        assert!(!manager.datagram().has_header());
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let datagram = sample(4, 20);
        let mut manager = PacketManager::new(Link::new());
        manager.transport_mut().feed(&[0x00, 0x13, 0x37]);
        for frame in frames_of(&datagram) {
            manager.transport_mut().feed(&frame);
        }

        let mut delivered = Vec::new();
        pump(&mut manager, &mut delivered);
        assert_eq!(delivered.len(), 1);
        assert_eq!(manager.stats().bytes_skipped, 3);
    }

    #[test]
    fn bad_end_marker_is_malformed() {
        let datagram = sample(5, 20);
        let mut frame = frames_of(&datagram)[0];
        frame[PACKET_SERIALIZED_SIZE - 1] = 0x00;
        let mut manager = PacketManager::new(Link::new());
        manager.transport_mut().feed(&frame);

        let mut handler = |_: &Datagram| -> Result<(), FotaError> { Ok(()) };
        assert_eq!(
            manager.process(&mut handler),
            Ok(PacketOutcome::Discarded(DiscardReason::Malformed))
        );
    }

    #[test]
    fn duplicate_packet_surfaces_internal_error() {
        let datagram = sample(6, 300);
        let frames = frames_of(&datagram);
        let mut manager = PacketManager::new(Link::new());
        manager.transport_mut().feed(&frames[0]);
        manager.transport_mut().feed(&frames[1]);
        manager.transport_mut().feed(&frames[1]);

        let mut handler = |_: &Datagram| -> Result<(), FotaError> { Ok(()) };
        assert_eq!(manager.process(&mut handler), Ok(PacketOutcome::Accepted));
        assert_eq!(manager.process(&mut handler), Ok(PacketOutcome::Accepted));
        assert_eq!(manager.process(&mut handler), Err(FotaError::InternalError));
        assert_eq!(manager.stats().packets_rejected, 1);
    }

    #[test]
    fn handler_result_is_reported() {
        let datagram = sample(7, 16);
        let mut manager = PacketManager::new(Link::new());
        for frame in frames_of(&datagram) {
            manager.transport_mut().feed(&frame);
        }

        let mut refusing = |_: &Datagram| -> Result<(), FotaError> { Err(FotaError::BootloaderInvalidState) };
        manager.process(&mut refusing).unwrap();
        assert_eq!(
            manager.process(&mut refusing),
            Ok(PacketOutcome::Delivered(Delivery {
                kind: DatagramKind::FirmwareChunk,
                datagram_id: 7,
                result: Err(FotaError::BootloaderInvalidState),
            }))
        );
    }

    #[test]
    fn send_datagram_writes_every_frame() {
        let datagram = sample(8, 300);
        let mut manager = PacketManager::new(Link::new());
        manager.send_datagram(&datagram).unwrap();

        let sent = manager.transport().sent().to_vec();
        assert_eq!(sent.len(), 4 * PACKET_SERIALIZED_SIZE);

        let mut receiver = PacketManager::new(Link::new());
        receiver.transport_mut().feed(&sent);
        let mut delivered = Vec::new();
        pump(&mut receiver, &mut delivered);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, datagram.data());
    }
}
