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

//! Device firmware update state machine.
//!
//! ```text
//! UNINITIALIZED --init--> IDLE --metadata--> RECEIVING --last chunk--> COMPLETE
//!                                                                          |
//!                                           JUMP <--finalized-------------+
//! ```
//!
//! Images are written to the staging region as chunks arrive, checked against
//! the CRC32 from the metadata once the last chunk lands, then copied page by
//! page into the active region. Nothing is jumped to until a jump request
//! datagram arrives.
//!
//! The installed image record is erased before the active region is touched
//! and only written back once the copy reads back with the right CRC32, so a
//! copy cut short leaves no record vouching for a torn image.

pub mod config;
pub mod record;

use embedded_storage::nor_flash::NorFlash;

pub use config::DfuConfig;
use config::MAX_WRITE_SIZE;
pub use record::ImageRecord;

use crate::datagram::payload::{FirmwareMetadata, JumpToApp};
use crate::datagram::{Datagram, DatagramKind};
use crate::error::FotaError;
use crate::flash::{self, FLASH_BLOCK_SIZE};
use crate::jump::{Jump, JumpTarget};
use crate::packet_manager::DatagramHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuState {
    Uninitialized,
    Idle,
    Receiving,
    /// Every byte is staged; finalization has not succeeded yet
    Complete,
    /// Image verified and installed, waiting to be jumped to
    Jump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_written: u32,
    pub binary_size: u32,
}

#[derive(Debug, Default)]
struct DfuContext {
    metadata: Option<FirmwareMetadata>,
    cursor: u32,
    bytes_written: u32,
    expected_chunk_id: u32,
}

pub struct Dfu<F: NorFlash, J: Jump> {
    flash: F,
    jumper: J,
    state: DfuState,
    config: Option<DfuConfig>,
    context: DfuContext,
}

impl<F: NorFlash, J: Jump> Dfu<F, J> {
    pub fn new(flash: F, jumper: J) -> Self {
        Self {
            flash,
            jumper,
            state: DfuState::Uninitialized,
            config: None,
            context: DfuContext::default(),
        }
    }

    /// Checks the flash layout and moves to IDLE.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`: regions misaligned, overlapping or outside the flash,
    ///   or a flash write size the DFU cannot pad to
    pub fn init(&mut self, config: DfuConfig) -> Result<(), FotaError> {
        config.validate(&self.flash)?;
        self.config = Some(config);
        self.context = DfuContext::default();
        self.state = DfuState::Idle;
        log::debug!(
            "DFU ready: staging {:#x}, active {:#x}, {} bytes each",
            config.staging_offset,
            config.active_offset,
            config.region_size
        );
        Ok(())
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn progress(&self) -> Progress {
        Progress {
            bytes_written: self.context.bytes_written,
            binary_size: self.context.metadata.map(|m| m.binary_size).unwrap_or(0),
        }
    }

    /// Metadata of the image currently being received or installed.
    pub fn firmware_info(&self) -> Option<&FirmwareMetadata> {
        self.context.metadata.as_ref()
    }

    /// Record of the last installed image, if the layout keeps one.
    pub fn installed_image(&mut self) -> Result<Option<ImageRecord>, FotaError> {
        match self.config.and_then(|c| c.metadata_offset) {
            Some(offset) => ImageRecord::load(&mut self.flash, offset),
            None => Ok(None),
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn jumper(&self) -> &J {
        &self.jumper
    }

    /// Feeds one complete, verified datagram into the state machine.
    ///
    /// # Errors
    ///
    /// - `BootloaderUninitialized`: [`Dfu::init`] has not succeeded
    /// - `BootloaderInvalidState`: datagram kind not accepted in this state
    /// - `InvalidDatagram`, `SequenceOutOfOrder`, `BinaryOversized`: the
    ///   datagram was rejected and nothing was written
    /// - `FlashVerificationFailed`: the staged or installed image is bad
    /// - `Flash(_)`: the flash driver failed
    /// - `BootloaderFailure`: a jump was attempted and came back
    pub fn process(&mut self, datagram: &Datagram) -> Result<(), FotaError> {
        let config = match (self.state, self.config) {
            (DfuState::Uninitialized, _) | (_, None) => return Err(FotaError::BootloaderUninitialized),
            (_, Some(config)) => config,
        };

        match (self.state, datagram.kind()) {
            (_, DatagramKind::JumpToApp) => self.handle_jump_request(config, datagram),
            (DfuState::Idle, DatagramKind::FirmwareMetadata) => self.handle_metadata(config, datagram),
            (DfuState::Receiving, DatagramKind::FirmwareChunk) => self.handle_chunk(config, datagram),
            (state, kind) => {
                log::warn!("{:?} datagram not accepted while {:?}", kind, state);
                Err(FotaError::BootloaderInvalidState)
            }
        }
    }

    /// Jumps to the installed application, whatever state the update is in.
    /// Used when the update session has gone quiet and the node should get
    /// back to work.
    ///
    /// Only returns if the jump was refused or failed. Refused means
    /// [`Dfu::check_installed`] found nothing safe to run and its error is
    /// returned; `BootloaderFailure` means the jump itself came back.
    pub fn fail_safe_jump(&mut self) -> FotaError {
        if let Err(e) = self.check_installed() {
            log::error!("Fail safe jump refused: {}", e);
            return e;
        }
        log::warn!("Fail safe jump to application");
        self.jump_to(JumpTarget::Application)
    }

    /// Checks the active region holds an image worth running.
    ///
    /// With a record page the active region must match the recorded size and
    /// CRC32. Without one the most that can be said is that the start of the
    /// region is not blank.
    ///
    /// # Errors
    ///
    /// - `BootloaderUninitialized`: [`Dfu::init`] has not succeeded
    /// - `FlashVerificationFailed`: no record, or the region does not match it
    /// - `Flash(_)`: the flash driver failed
    pub fn check_installed(&mut self) -> Result<(), FotaError> {
        let Some(config) = self.config else {
            return Err(FotaError::BootloaderUninitialized);
        };

        let Some(offset) = config.metadata_offset else {
            let head = config.region_size.min(FLASH_BLOCK_SIZE as u32);
            if flash::is_blank(&mut self.flash, config.active_offset, head)? {
                log::warn!("Active region is blank");
                return Err(FotaError::FlashVerificationFailed);
            }
            return Ok(());
        };

        let Some(record) = ImageRecord::load(&mut self.flash, offset)? else {
            log::warn!("No installed image record");
            return Err(FotaError::FlashVerificationFailed);
        };
        if record.binary_size == 0 || record.binary_size > config.region_size {
            log::error!("Image record claims {} bytes", record.binary_size);
            return Err(FotaError::FlashVerificationFailed);
        }
        let crc = flash::image_crc(&mut self.flash, config.active_offset, record.binary_size)?;
        if crc != record.crc32 {
            log::error!("Active image crc {:#010x}, record says {:#010x}", crc, record.crc32);
            return Err(FotaError::FlashVerificationFailed);
        }
        log::debug!(
            "Installed image v{}.{} verified, {} bytes",
            record.version_major,
            record.version_minor,
            record.binary_size
        );
        Ok(())
    }

    /// Only returns if the jump failed.
    pub fn jump_to(&mut self, target: JumpTarget) -> FotaError {
        let reason = self.jumper.jump(target);
        log::error!("Jump to {:?} returned: {}", target, reason);
        FotaError::BootloaderFailure
    }

    fn handle_metadata(&mut self, config: DfuConfig, datagram: &Datagram) -> Result<(), FotaError> {
        let metadata = FirmwareMetadata::decode(datagram.data())?;
        if metadata.binary_size == 0 || metadata.binary_size > config.region_size {
            log::warn!(
                "Image of {} bytes does not fit region of {} bytes",
                metadata.binary_size,
                config.region_size
            );
            return Err(FotaError::BinaryOversized);
        }

        let span = flash::page_span::<F>(metadata.binary_size);
        flash::erase(&mut self.flash, config.staging_offset, config.staging_offset + span)?;

        self.context = DfuContext {
            metadata: Some(metadata),
            cursor: config.staging_offset,
            bytes_written: 0,
            expected_chunk_id: 0,
        };
        self.state = DfuState::Receiving;
        log::debug!(
            "Receiving image v{}.{}, {} bytes, crc {:#010x}",
            metadata.version_major,
            metadata.version_minor,
            metadata.binary_size,
            metadata.expected_crc32
        );
        Ok(())
    }

    fn handle_chunk(&mut self, config: DfuConfig, datagram: &Datagram) -> Result<(), FotaError> {
        let Some(metadata) = self.context.metadata else {
            return Err(FotaError::BootloaderInvalidState);
        };

        if datagram.datagram_id() != self.context.expected_chunk_id {
            log::warn!(
                "Chunk {} out of order, expected {}",
                datagram.datagram_id(),
                self.context.expected_chunk_id
            );
            return Err(FotaError::SequenceOutOfOrder);
        }

        let data = datagram.data();
        if data.is_empty() {
            return Err(FotaError::InvalidDatagram);
        }
        let remaining = metadata.binary_size - self.context.bytes_written;
        if data.len() as u32 > remaining {
            log::warn!("Chunk of {} bytes overruns image, {} left", data.len(), remaining);
            return Err(FotaError::BinaryOversized);
        }
        let is_last = data.len() as u32 == remaining;
        let write_size = F::WRITE_SIZE;
        if !is_last && data.len() % write_size != 0 {
            return Err(FotaError::InvalidDatagram);
        }

        // a half programmed chunk cannot be written again, so the image is abandoned
        if let Err(e) = self.write_chunk(data) {
            log::error!("Chunk {} write failed ({}), abandoning the image", datagram.datagram_id(), e);
            self.context = DfuContext::default();
            self.state = DfuState::Idle;
            return Err(e);
        }

        self.context.cursor += data.len() as u32;
        self.context.bytes_written += data.len() as u32;
        self.context.expected_chunk_id += 1;
        log::trace!(
            "Chunk {} written, {}/{} bytes",
            datagram.datagram_id(),
            self.context.bytes_written,
            metadata.binary_size
        );

        if is_last {
            self.state = DfuState::Complete;
            self.finalize(config, &metadata)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), FotaError> {
        let write_size = F::WRITE_SIZE;
        let aligned = data.len() - data.len() % write_size;
        if aligned > 0 {
            flash::write(&mut self.flash, self.context.cursor, &data[..aligned])?;
        }
        if aligned < data.len() {
            let mut tail = [0xFFu8; MAX_WRITE_SIZE];
            let rest = &data[aligned..];
            tail[..rest.len()].copy_from_slice(rest);
            flash::write(&mut self.flash, self.context.cursor + aligned as u32, &tail[..write_size])?;
        }
        Ok(())
    }

    fn finalize(&mut self, config: DfuConfig, metadata: &FirmwareMetadata) -> Result<(), FotaError> {
        let staged_crc = flash::image_crc(&mut self.flash, config.staging_offset, metadata.binary_size)?;
        if staged_crc != metadata.expected_crc32 {
            log::error!(
                "Staged image crc {:#010x}, expected {:#010x}",
                staged_crc,
                metadata.expected_crc32
            );
            return Err(FotaError::FlashVerificationFailed);
        }

        if let Some(offset) = config.metadata_offset {
            ImageRecord::clear(&mut self.flash, offset)?;
        }
        flash::copy_pages(
            &mut self.flash,
            config.staging_offset,
            config.active_offset,
            metadata.binary_size,
        )?;

        let installed_crc = flash::image_crc(&mut self.flash, config.active_offset, metadata.binary_size)?;
        if installed_crc != metadata.expected_crc32 {
            log::error!("Installed image crc {:#010x} does not match", installed_crc);
            return Err(FotaError::FlashVerificationFailed);
        }

        if let Some(offset) = config.metadata_offset {
            ImageRecord::from(metadata).store(&mut self.flash, offset)?;
        }

        self.state = DfuState::Jump;
        log::debug!("Image installed, waiting for jump request");
        Ok(())
    }

    fn handle_jump_request(&mut self, config: DfuConfig, datagram: &Datagram) -> Result<(), FotaError> {
        JumpToApp::decode(datagram.data())?;

        let Some(metadata) = self.context.metadata else {
            return Err(FotaError::BootloaderInvalidState);
        };
        match self.state {
            DfuState::Complete => self.finalize(config, &metadata)?,
            DfuState::Jump => {}
            state => {
                log::warn!("Jump requested while {:?}", state);
                return Err(FotaError::BootloaderInvalidState);
            }
        }

        if flash::is_blank(&mut self.flash, config.active_offset, metadata.binary_size)? {
            log::error!("Active region is blank, refusing to jump");
            return Err(FotaError::FlashVerificationFailed);
        }

        Err(self.jump_to(JumpTarget::Application))
    }
}

impl<F: NorFlash, J: Jump> DatagramHandler for Dfu<F, J> {
    fn on_datagram_complete(&mut self, datagram: &Datagram) -> Result<(), FotaError> {
        self.process(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::builder::DatagramBuilder;
    use crate::error::FlashError;
    use crate::sim::{FlashOperation, RecordingJump, SimulatedFlash};

    type Flash = SimulatedFlash<{ 64 * 1024 }, 2048>;
    type TestDfu = Dfu<Flash, RecordingJump>;

    const ACTIVE: usize = 0x2000;
    const STAGING: usize = 0x8000;
    const RECORD: u32 = 0xF000;

    fn config() -> DfuConfig {
        DfuConfig {
            staging_offset: STAGING as u32,
            active_offset: ACTIVE as u32,
            region_size: 0x6000,
            metadata_offset: Some(RECORD),
        }
    }

    fn ready_dfu() -> TestDfu {
        let mut dfu = Dfu::new(Flash::new(), RecordingJump::new());
        dfu.init(config()).unwrap();
        dfu
    }

    fn firmware(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    fn metadata_for(image: &[u8]) -> Datagram {
        metadata_with_crc(image.len() as u32, crate::crc::crc32_padded(image))
    }

    fn metadata_with_crc(size: u32, crc: u32) -> Datagram {
        DatagramBuilder::new()
            .firmware_metadata()
            .binary_size(size)
            .expected_crc32(crc)
            .version(1, 0)
            .firmware_id(b"TEST_FW_ID_01")
            .build(0xFFFF_0000)
            .unwrap()
    }

    fn chunks(image: &[u8], size: usize) -> Vec<Datagram> {
        image
            .chunks(size)
            .enumerate()
            .map(|(i, c)| DatagramBuilder::new().firmware_chunk(c).build(i as u32).unwrap())
            .collect()
    }

    fn jump_request() -> Datagram {
        DatagramBuilder::new().jump_to_app().build(0xFFFF_0001).unwrap()
    }

    #[test]
    fn process_before_init_is_rejected() {
        let mut dfu: TestDfu = Dfu::new(Flash::new(), RecordingJump::new());
        assert_eq!(dfu.state(), DfuState::Uninitialized);
        assert_eq!(
            dfu.process(&metadata_for(&firmware(64))),
            Err(FotaError::BootloaderUninitialized)
        );
    }

    #[test]
    fn init_rejects_bad_layout() {
        let mut dfu: TestDfu = Dfu::new(Flash::new(), RecordingJump::new());
        let bad = DfuConfig {
            active_offset: 0x7000,
            ..config()
        };
        assert_eq!(dfu.init(bad), Err(FotaError::InvalidArgs));
        assert_eq!(dfu.state(), DfuState::Uninitialized);
    }

    #[test]
    fn full_update_installs_image_then_jumps() {
        let image = firmware(512);
        let mut dfu = ready_dfu();

        assert_eq!(dfu.process(&metadata_for(&image)), Ok(()));
        assert_eq!(dfu.state(), DfuState::Receiving);

        for chunk in chunks(&image, 64) {
            assert_eq!(dfu.process(&chunk), Ok(()));
        }
        assert_eq!(dfu.state(), DfuState::Jump);
        assert_eq!(&dfu.flash().memory()[ACTIVE..ACTIVE + 512], &image[..]);
        assert_eq!(dfu.progress(), Progress { bytes_written: 512, binary_size: 512 });
        assert!(dfu.jumper().jumps().is_empty());

        let record = dfu.installed_image().unwrap().unwrap();
        assert_eq!(record.binary_size, 512);
        assert_eq!(record.crc32, crate::crc::crc32_padded(&image));

        assert_eq!(dfu.process(&jump_request()), Err(FotaError::BootloaderFailure));
        assert_eq!(dfu.jumper().jumps(), &[JumpTarget::Application]);
    }

    #[test]
    fn odd_sized_final_chunk_is_padded() {
        let image = firmware(2048 + 510);
        let mut dfu = ready_dfu();
        dfu.process(&metadata_for(&image)).unwrap();
        for chunk in chunks(&image, 2048) {
            dfu.process(&chunk).unwrap();
        }
        assert_eq!(dfu.state(), DfuState::Jump);
        assert_eq!(&dfu.flash().memory()[ACTIVE..ACTIVE + image.len()], &image[..]);
    }

    #[test]
    fn chunk_while_idle_is_invalid_state() {
        let mut dfu = ready_dfu();
        let chunk = DatagramBuilder::new().firmware_chunk(&[0u8; 64]).build(0).unwrap();
        assert_eq!(dfu.process(&chunk), Err(FotaError::BootloaderInvalidState));
        assert_eq!(dfu.state(), DfuState::Idle);
    }

    #[test]
    fn second_metadata_while_receiving_is_invalid_state() {
        let image = firmware(256);
        let mut dfu = ready_dfu();
        dfu.process(&metadata_for(&image)).unwrap();
        assert_eq!(dfu.process(&metadata_for(&image)), Err(FotaError::BootloaderInvalidState));
    }

    #[test]
    fn out_of_order_chunk_writes_nothing() {
        let image = firmware(256);
        let mut dfu = ready_dfu();
        dfu.process(&metadata_for(&image)).unwrap();

        let all = chunks(&image, 64);
        assert_eq!(dfu.process(&all[1]), Err(FotaError::SequenceOutOfOrder));
        assert!(dfu.flash().memory()[STAGING..STAGING + 256].iter().all(|b| *b == 0xFF));

        dfu.process(&all[0]).unwrap();
        assert_eq!(dfu.process(&all[0]), Err(FotaError::SequenceOutOfOrder));
        assert_eq!(dfu.progress().bytes_written, 64);
    }

    #[test]
    fn oversized_images_are_rejected() {
        let mut dfu = ready_dfu();
        assert_eq!(
            dfu.process(&metadata_with_crc(0x6001, 0)),
            Err(FotaError::BinaryOversized)
        );
        assert_eq!(dfu.process(&metadata_with_crc(0, 0)), Err(FotaError::BinaryOversized));
        assert_eq!(dfu.state(), DfuState::Idle);

        let image = firmware(100);
        dfu.process(&metadata_for(&image)).unwrap();
        let too_big = DatagramBuilder::new().firmware_chunk(&firmware(128)).build(0).unwrap();
        assert_eq!(dfu.process(&too_big), Err(FotaError::BinaryOversized));
    }

    #[test]
    fn unaligned_middle_chunk_is_rejected() {
        let image = firmware(256);
        let mut dfu = ready_dfu();
        dfu.process(&metadata_for(&image)).unwrap();
        let chunk = DatagramBuilder::new().firmware_chunk(&image[..63]).build(0).unwrap();
        assert_eq!(dfu.process(&chunk), Err(FotaError::InvalidDatagram));
    }

    #[test]
    fn crc_mismatch_keeps_active_region_untouched() {
        let image = firmware(256);
        let mut dfu = ready_dfu();
        dfu.process(&metadata_with_crc(256, 0xBAD0_BAD0)).unwrap();

        let all = chunks(&image, 128);
        dfu.process(&all[0]).unwrap();
        assert_eq!(dfu.process(&all[1]), Err(FotaError::FlashVerificationFailed));
        assert_eq!(dfu.state(), DfuState::Complete);
        assert!(dfu.flash().memory()[ACTIVE..ACTIVE + 256].iter().all(|b| *b == 0xFF));

        // a jump request retries finalization, which fails the same way
        assert_eq!(dfu.process(&jump_request()), Err(FotaError::FlashVerificationFailed));
        assert!(dfu.jumper().jumps().is_empty());
    }

    #[test]
    fn jump_request_needs_a_finished_image() {
        let mut dfu = ready_dfu();
        assert_eq!(dfu.process(&jump_request()), Err(FotaError::BootloaderInvalidState));

        let image = firmware(128);
        dfu.process(&metadata_for(&image)).unwrap();
        assert_eq!(dfu.process(&jump_request()), Err(FotaError::BootloaderInvalidState));

        let bad_magic = DatagramBuilder::new().jump_to_app().magic(0x0BAD_F00D).build(1).unwrap();
        assert_eq!(dfu.process(&bad_magic), Err(FotaError::InvalidDatagram));
        assert!(dfu.jumper().jumps().is_empty());
    }

    #[test]
    fn blank_image_is_not_jumped_to() {
        let image = [0xFFu8; 64];
        let mut dfu = ready_dfu();
        dfu.process(&metadata_for(&image)).unwrap();
        dfu.process(&chunks(&image, 64)[0]).unwrap();
        assert_eq!(dfu.state(), DfuState::Jump);

        assert_eq!(dfu.process(&jump_request()), Err(FotaError::FlashVerificationFailed));
        assert!(dfu.jumper().jumps().is_empty());
    }

    #[test]
    fn flash_errors_propagate_unchanged() {
        let image = firmware(128);
        let mut flash = Flash::new();
        flash.fail_next(FlashOperation::Erase);
        let mut dfu = Dfu::new(flash, RecordingJump::new());
        dfu.init(config()).unwrap();

        assert_eq!(
            dfu.process(&metadata_for(&image)),
            Err(FotaError::Flash(FlashError::EraseFailed))
        );
        assert_eq!(dfu.state(), DfuState::Idle);
        assert_eq!(dfu.process(&metadata_for(&image)), Ok(()));
    }

    #[test]
    fn other_datagram_kinds_are_invalid_state() {
        let mut dfu = ready_dfu();
        let request = Datagram::init(DatagramKind::UpdateRequest, 1, &[1, 2, 3]).unwrap();
        assert_eq!(dfu.process(&request), Err(FotaError::BootloaderInvalidState));
    }

    /// Flash holding `image` in the active region with a matching record.
    fn flash_with_installed(image: &[u8]) -> Flash {
        let mut flash = Flash::new();
        flash.preload(ACTIVE, image);
        let record = ImageRecord {
            binary_size: image.len() as u32,
            crc32: crate::crc::crc32_padded(image),
            version_major: 1,
            version_minor: 0,
            firmware_id: [0u8; 16],
        };
        record.store(&mut flash, RECORD).unwrap();
        flash
    }

    fn patterned(len: usize, d: usize) -> Vec<u8> {
        (0..len).map(|i| ((i + d) & 0xFF) as u8).collect()
    }

    #[test]
    fn fail_safe_jump_targets_installed_application() {
        let image = firmware(1000);
        let mut dfu = ready_dfu();
        dfu.process(&metadata_for(&image)).unwrap();
        for chunk in chunks(&image, 1000) {
            dfu.process(&chunk).unwrap();
        }

        assert_eq!(dfu.check_installed(), Ok(()));
        assert_eq!(dfu.fail_safe_jump(), FotaError::BootloaderFailure);
        assert_eq!(dfu.jumper().jumps(), &[JumpTarget::Application]);
    }

    #[test]
    fn fail_safe_jump_refuses_without_an_image() {
        let mut dfu = ready_dfu();
        assert_eq!(dfu.fail_safe_jump(), FotaError::FlashVerificationFailed);

        let mut unrecorded = Dfu::new(Flash::new(), RecordingJump::new());
        unrecorded
            .init(DfuConfig {
                metadata_offset: None,
                ..config()
            })
            .unwrap();
        assert_eq!(unrecorded.fail_safe_jump(), FotaError::FlashVerificationFailed);

        let mut flash = Flash::new();
        flash.preload(ACTIVE, &firmware(64));
        let mut present = Dfu::new(flash, RecordingJump::new());
        present
            .init(DfuConfig {
                metadata_offset: None,
                ..config()
            })
            .unwrap();
        assert_eq!(present.fail_safe_jump(), FotaError::BootloaderFailure);

        assert!(dfu.jumper().jumps().is_empty());
        assert!(unrecorded.jumper().jumps().is_empty());
        assert_eq!(present.jumper().jumps(), &[JumpTarget::Application]);
    }

    #[test]
    fn fail_safe_jump_refuses_image_not_matching_its_record() {
        let image = firmware(4096);
        let mut flash = flash_with_installed(&image);
        flash.preload(ACTIVE + 3000, &[0x00]);
        let mut dfu = Dfu::new(flash, RecordingJump::new());
        dfu.init(config()).unwrap();

        assert!(dfu.installed_image().unwrap().is_some());
        assert_eq!(dfu.check_installed(), Err(FotaError::FlashVerificationFailed));
        assert_eq!(dfu.fail_safe_jump(), FotaError::FlashVerificationFailed);
        assert!(dfu.jumper().jumps().is_empty());
    }

    #[test]
    fn interrupted_install_leaves_no_record() {
        let old = patterned(4096, 0);
        let new = patterned(4096, 1);
        let mut flash = flash_with_installed(&old);
        // staging erase, record erase and the first active page go through
        flash.fail_after(FlashOperation::Erase, 3);
        let mut dfu = Dfu::new(flash, RecordingJump::new());
        dfu.init(config()).unwrap();
        assert_eq!(dfu.check_installed(), Ok(()));

        dfu.process(&metadata_for(&new)).unwrap();
        let all = chunks(&new, 2048);
        dfu.process(&all[0]).unwrap();
        assert_eq!(dfu.process(&all[1]), Err(FotaError::Flash(FlashError::EraseFailed)));

        // first active page already holds the new image, the second the old one
        assert_eq!(&dfu.flash().memory()[ACTIVE..ACTIVE + 2048], &new[..2048]);
        assert_eq!(&dfu.flash().memory()[ACTIVE + 2048..ACTIVE + 4096], &old[2048..]);
        assert_eq!(dfu.installed_image(), Ok(None));
        assert_eq!(dfu.fail_safe_jump(), FotaError::FlashVerificationFailed);
        assert!(dfu.jumper().jumps().is_empty());

        // a jump request retries the copy and completes the install
        assert_eq!(dfu.process(&jump_request()), Err(FotaError::BootloaderFailure));
        assert_eq!(&dfu.flash().memory()[ACTIVE..ACTIVE + 4096], &new[..]);
        assert_eq!(dfu.check_installed(), Ok(()));
        assert_eq!(dfu.jumper().jumps(), &[JumpTarget::Application]);
    }

    #[test]
    fn failed_chunk_write_abandons_the_image() {
        let image = firmware(2048 + 510);
        let mut flash = Flash::new();
        // chunk 0 and the aligned part of chunk 1 land, the padded tail does not
        flash.fail_after(FlashOperation::Write, 2);
        let mut dfu = Dfu::new(flash, RecordingJump::new());
        dfu.init(config()).unwrap();

        dfu.process(&metadata_for(&image)).unwrap();
        let all = chunks(&image, 2048);
        dfu.process(&all[0]).unwrap();
        assert_eq!(dfu.process(&all[1]), Err(FotaError::Flash(FlashError::WriteFailed)));
        assert_eq!(dfu.state(), DfuState::Idle);
        assert_eq!(dfu.progress().bytes_written, 0);
        assert_eq!(dfu.process(&all[1]), Err(FotaError::BootloaderInvalidState));

        dfu.process(&metadata_for(&image)).unwrap();
        for chunk in &all {
            dfu.process(chunk).unwrap();
        }
        assert_eq!(dfu.state(), DfuState::Jump);
        assert_eq!(&dfu.flash().memory()[ACTIVE..ACTIVE + image.len()], &image[..]);
    }

    #[test]
    fn back_to_back_updates_install_independently() {
        let mut dfu = ready_dfu();
        for d in 0..2 {
            let image = patterned(3000, d);
            if d > 0 {
                // the node restarts into the bootloader for every update
                dfu.init(config()).unwrap();
            }
            dfu.process(&metadata_for(&image)).unwrap();
            for chunk in chunks(&image, 1024) {
                dfu.process(&chunk).unwrap();
            }
            assert_eq!(dfu.state(), DfuState::Jump);
            assert_eq!(dfu.progress(), Progress { bytes_written: 3000, binary_size: 3000 });
            assert_eq!(&dfu.flash().memory()[ACTIVE..ACTIVE + 3000], &image[..]);
            assert_eq!(
                dfu.installed_image().unwrap().map(|r| r.crc32),
                Some(crate::crc::crc32_padded(&image))
            );
            assert_eq!(dfu.process(&jump_request()), Err(FotaError::BootloaderFailure));
        }
        assert_eq!(dfu.jumper().jumps(), &[JumpTarget::Application, JumpTarget::Application]);
    }
}
