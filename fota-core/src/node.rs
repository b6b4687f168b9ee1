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

use embedded_io::{Read, Write};
use embedded_storage::nor_flash::NorFlash;

use crate::SESSION_INACTIVITY_TIMEOUT_MS;
use crate::datagram::builder::DatagramBuilder;
use crate::datagram::payload::Acknowledgement;
use crate::datagram::{Datagram, DatagramKind};
use crate::dfu::Dfu;
use crate::error::FotaError;
use crate::jump::Jump;
use crate::packet_manager::{DatagramHandler, DiscardReason, PacketManager, PacketOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// Datagrams addressed to another node are ignored. `None` accepts all.
    pub node_id: Option<u8>,
    pub inactivity_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            inactivity_timeout_ms: SESSION_INACTIVITY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Idle,
    Discarded(DiscardReason),
    PacketAccepted,
    /// A packet passed its CRC but the reassembler refused it
    PacketRejected(FotaError),
    DatagramFailedVerification { datagram_id: u32 },
    NotAddressed { datagram_id: u32 },
    DatagramHandled {
        kind: DatagramKind,
        datagram_id: u32,
        result: Result<(), FotaError>,
    },
}

/// Passes datagrams for this node on to the DFU and notes the rest.
struct AddressedHandler<'a, F: NorFlash, J: Jump> {
    dfu: &'a mut Dfu<F, J>,
    node_id: Option<u8>,
    addressed_elsewhere: bool,
}

impl<F: NorFlash, J: Jump> DatagramHandler for AddressedHandler<'_, F, J> {
    fn on_datagram_complete(&mut self, datagram: &Datagram) -> Result<(), FotaError> {
        if let (Some(ours), Some(target)) = (self.node_id, datagram.header().target_node) {
            if ours != target {
                self.addressed_elsewhere = true;
                return Ok(());
            }
        }
        self.dfu.process(datagram)
    }
}

/// The bootloader's update loop: one packet manager feeding one DFU.
pub struct FotaNode<T, F: NorFlash, J: Jump> {
    packet_manager: PacketManager<T>,
    dfu: Dfu<F, J>,
    config: NodeConfig,
    last_activity_ms: Option<u64>,
}

impl<T: Read + Write, F: NorFlash, J: Jump> FotaNode<T, F, J> {
    pub fn new(packet_manager: PacketManager<T>, dfu: Dfu<F, J>, config: NodeConfig) -> Self {
        Self {
            packet_manager,
            dfu,
            config,
            last_activity_ms: None,
        }
    }

    pub fn dfu(&self) -> &Dfu<F, J> {
        &self.dfu
    }

    pub fn packet_manager(&self) -> &PacketManager<T> {
        &self.packet_manager
    }

    pub fn packet_manager_mut(&mut self) -> &mut PacketManager<T> {
        &mut self.packet_manager
    }

    /// Runs one step of the update loop.
    ///
    /// Every datagram the DFU handles is answered with an acknowledgement.
    /// When nothing valid has arrived for the inactivity timeout the node
    /// jumps to the application.
    ///
    /// # Errors
    ///
    /// - `BootloaderFailure`: the fail safe jump came back
    /// - `FlashVerificationFailed`: the fail safe jump was refused, see
    ///   [`FotaNode::check_inactivity`]
    /// - `TransportFailure`: the link failed other than by timing out
    pub fn poll(&mut self, now_ms: u64) -> Result<NodeEvent, FotaError> {
        self.last_activity_ms.get_or_insert(now_ms);

        let mut handler = AddressedHandler {
            dfu: &mut self.dfu,
            node_id: self.config.node_id,
            addressed_elsewhere: false,
        };
        let processed = self.packet_manager.process(&mut handler);
        let addressed_elsewhere = handler.addressed_elsewhere;

        let outcome = match processed {
            Ok(outcome) => outcome,
            Err(FotaError::TransportFailure) => return Err(FotaError::TransportFailure),
            Err(e) => {
                self.last_activity_ms = Some(now_ms);
                return Ok(NodeEvent::PacketRejected(e));
            }
        };

        let event = match outcome {
            PacketOutcome::Idle => {
                self.check_inactivity(now_ms)?;
                return Ok(NodeEvent::Idle);
            }
            PacketOutcome::Discarded(reason) => {
                self.check_inactivity(now_ms)?;
                return Ok(NodeEvent::Discarded(reason));
            }
            PacketOutcome::Accepted => NodeEvent::PacketAccepted,
            PacketOutcome::VerificationFailed { kind, datagram_id } => {
                self.acknowledge(kind, datagram_id, Err(FotaError::CrcMismatch));
                NodeEvent::DatagramFailedVerification { datagram_id }
            }
            PacketOutcome::Delivered(delivery) if addressed_elsewhere => {
                log::trace!("Datagram {} is for another node", delivery.datagram_id);
                NodeEvent::NotAddressed {
                    datagram_id: delivery.datagram_id,
                }
            }
            PacketOutcome::Delivered(delivery) => {
                if let Err(e) = delivery.result {
                    log::warn!("{:?} datagram {} refused: {}", delivery.kind, delivery.datagram_id, e);
                }
                self.acknowledge(delivery.kind, delivery.datagram_id, delivery.result);
                NodeEvent::DatagramHandled {
                    kind: delivery.kind,
                    datagram_id: delivery.datagram_id,
                    result: delivery.result,
                }
            }
        };

        self.last_activity_ms = Some(now_ms);
        Ok(event)
    }

    /// Jumps to the application if nothing valid has arrived for the inactivity timeout.
    ///
    /// Lets a caller that only polls when a whole frame is buffered still honour the timeout.
    /// If the DFU refuses the jump because there is no intact application, the
    /// timeout is switched off and the node keeps waiting for an update.
    pub fn check_inactivity(&mut self, now_ms: u64) -> Result<(), FotaError> {
        let last_activity = *self.last_activity_ms.get_or_insert(now_ms);
        let silent_ms = now_ms.saturating_sub(last_activity);
        if silent_ms >= self.config.inactivity_timeout_ms {
            log::warn!("No update traffic for {} ms", silent_ms);
            let reason = self.dfu.fail_safe_jump();
            if reason != FotaError::BootloaderFailure {
                self.config.inactivity_timeout_ms = u64::MAX;
            }
            return Err(reason);
        }
        Ok(())
    }

    /// Best effort: a lost acknowledgement is recovered by the sender retrying.
    fn acknowledge(&mut self, kind: DatagramKind, datagram_id: u32, result: Result<(), FotaError>) {
        let ack = Acknowledgement::for_result(kind, datagram_id, result);
        let sent = DatagramBuilder::new()
            .acknowledgement(ack)
            .build()
            .and_then(|datagram| self.packet_manager.send_datagram(&datagram));
        if let Err(e) = sent {
            log::warn!("Could not acknowledge datagram {}: {}", datagram_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc32_padded;
    use crate::datagram::payload::AckStatus;
    use crate::dfu::{DfuConfig, DfuState};
    use crate::jump::JumpTarget;
    use crate::sim::{LoopbackTransport, RecordingJump, SimulatedFlash};

    type Link = LoopbackTransport<{ 32 * 1024 }>;
    type Flash = SimulatedFlash<{ 64 * 1024 }, 2048>;
    type TestNode = FotaNode<Link, Flash, RecordingJump>;

    fn node(config: NodeConfig) -> TestNode {
        let mut flash = Flash::new();
        // something already installed for the fail safe jump to go to
        flash.preload(0x2000, &[0x20; 256]);
        let mut dfu = Dfu::new(flash, RecordingJump::new());
        dfu.init(DfuConfig {
            staging_offset: 0x8000,
            active_offset: 0x2000,
            region_size: 0x6000,
            metadata_offset: None,
        })
        .unwrap();
        FotaNode::new(PacketManager::new(Link::new()), dfu, config)
    }

    fn send(node: &mut TestNode, datagram: &Datagram) {
        let mut sender = PacketManager::new(Link::new());
        sender.send_datagram(datagram).unwrap();
        node.packet_manager_mut().transport_mut().feed(sender.transport().sent());
    }

    /// Polls until the link is drained and returns the handled datagram events.
    fn run(node: &mut TestNode, now_ms: u64) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        loop {
            match node.poll(now_ms).unwrap() {
                NodeEvent::Idle => return events,
                NodeEvent::PacketAccepted => {}
                event => events.push(event),
            }
        }
    }

    fn acknowledgements(node: &mut TestNode) -> Vec<Acknowledgement> {
        let sent = node.packet_manager().transport().sent().to_vec();
        node.packet_manager_mut().transport_mut().clear_sent();

        let mut receiver = PacketManager::new(Link::new());
        receiver.transport_mut().feed(&sent);
        let mut acks = Vec::new();
        loop {
            let mut collect = |d: &Datagram| -> Result<(), FotaError> {
                acks.push(Acknowledgement::decode(d.data()).unwrap());
                Ok(())
            };
            if receiver.process(&mut collect).unwrap() == PacketOutcome::Idle {
                return acks;
            }
        }
    }

    fn metadata(image: &[u8], target: Option<u8>) -> Datagram {
        DatagramBuilder::new()
            .target_node(target)
            .firmware_metadata()
            .binary_size(image.len() as u32)
            .expected_crc32(crc32_padded(image))
            .build(0xFFFF_0000)
            .unwrap()
    }

    #[test]
    fn update_is_acknowledged_datagram_by_datagram() {
        let image: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();
        let mut node = node(NodeConfig::default());

        send(&mut node, &metadata(&image, None));
        for (index, chunk) in image.chunks(2048).enumerate() {
            let datagram = DatagramBuilder::new().firmware_chunk(chunk).build(index as u32).unwrap();
            send(&mut node, &datagram);
        }

        let events = run(&mut node, 0);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(e, NodeEvent::DatagramHandled { result: Ok(()), .. })));
        assert_eq!(node.dfu().state(), DfuState::Jump);

        let acks = acknowledgements(&mut node);
        assert_eq!(acks.len(), 3);
        assert_eq!(acks[0].response_to, DatagramKind::FirmwareMetadata);
        assert_eq!(acks[2].response_to_id, 1);
        assert!(acks.iter().all(|a| a.status == AckStatus::Ack));

        send(&mut node, &DatagramBuilder::new().jump_to_app().build(0xFFFF_0001).unwrap());
        run(&mut node, 10);
        assert_eq!(node.dfu().jumper().jumps(), &[JumpTarget::Application]);
    }

    #[test]
    fn refused_datagram_is_nacked_with_its_error() {
        let mut node = node(NodeConfig::default());
        let chunk = DatagramBuilder::new().firmware_chunk(&[0u8; 64]).build(0).unwrap();
        send(&mut node, &chunk);

        let events = run(&mut node, 0);
        assert_eq!(
            events,
            vec![NodeEvent::DatagramHandled {
                kind: DatagramKind::FirmwareChunk,
                datagram_id: 0,
                result: Err(FotaError::BootloaderInvalidState),
            }]
        );

        let acks = acknowledgements(&mut node);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, AckStatus::Nack);
        assert_eq!(acks[0].error(), Some(FotaError::BootloaderInvalidState));
    }

    #[test]
    fn datagrams_for_other_nodes_are_ignored() {
        let image = [0x5Au8; 128];
        let mut node = node(NodeConfig {
            node_id: Some(1),
            ..NodeConfig::default()
        });

        send(&mut node, &metadata(&image, Some(2)));
        assert_eq!(run(&mut node, 0), vec![NodeEvent::NotAddressed { datagram_id: 0xFFFF_0000 }]);
        assert_eq!(node.dfu().state(), DfuState::Idle);
        assert!(node.packet_manager().transport().sent().is_empty());

        send(&mut node, &metadata(&image, Some(1)));
        run(&mut node, 0);
        assert_eq!(node.dfu().state(), DfuState::Receiving);
    }

    #[test]
    fn silence_forces_the_fail_safe_jump() {
        let mut node = node(NodeConfig::default());
        assert_eq!(node.poll(1_000), Ok(NodeEvent::Idle));
        assert_eq!(node.poll(1_000 + SESSION_INACTIVITY_TIMEOUT_MS - 1), Ok(NodeEvent::Idle));
        assert_eq!(
            node.poll(1_000 + SESSION_INACTIVITY_TIMEOUT_MS),
            Err(FotaError::BootloaderFailure)
        );
        assert_eq!(node.dfu().jumper().jumps(), &[JumpTarget::Application]);
    }

    #[test]
    fn refused_fail_safe_jump_stops_the_timer() {
        let mut dfu = Dfu::new(Flash::new(), RecordingJump::new());
        dfu.init(DfuConfig {
            staging_offset: 0x8000,
            active_offset: 0x2000,
            region_size: 0x6000,
            metadata_offset: None,
        })
        .unwrap();
        let mut node = FotaNode::new(
            PacketManager::new(Link::new()),
            dfu,
            NodeConfig {
                inactivity_timeout_ms: 500,
                ..NodeConfig::default()
            },
        );

        assert_eq!(node.check_inactivity(0), Ok(()));
        assert_eq!(node.check_inactivity(500), Err(FotaError::FlashVerificationFailed));
        assert_eq!(node.check_inactivity(100_000), Ok(()));
        assert_eq!(node.poll(200_000), Ok(NodeEvent::Idle));
        assert!(node.dfu().jumper().jumps().is_empty());
    }

    #[test]
    fn inactivity_can_be_checked_without_reading() {
        let mut node = node(NodeConfig {
            inactivity_timeout_ms: 500,
            ..NodeConfig::default()
        });
        assert_eq!(node.check_inactivity(100), Ok(()));
        assert_eq!(node.check_inactivity(599), Ok(()));
        assert_eq!(node.check_inactivity(600), Err(FotaError::BootloaderFailure));
    }

    #[test]
    fn traffic_resets_the_inactivity_timer() {
        let image = [0x11u8; 256];
        let mut node = node(NodeConfig::default());
        assert_eq!(node.poll(0), Ok(NodeEvent::Idle));

        send(&mut node, &metadata(&image, None));
        run(&mut node, 10_000);
        assert_eq!(node.poll(20_000), Ok(NodeEvent::Idle));
        assert!(node.dfu().jumper().jumps().is_empty());
    }
}
