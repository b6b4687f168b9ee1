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

use core::fmt;

/// Failures reported by the flash driver, kept apart so callers can tell a
/// misaligned request from one that runs off the end of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Offset or length did not meet the driver's granularity
    NotAligned,
    /// Request reached outside the flash device
    OutOfBounds,
    ReadFailed,
    WriteFailed,
    EraseFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FotaError {
    /// A caller supplied argument was out of range or too small
    InvalidArgs,
    /// A fixed capacity structure is full
    ResourceExhausted,
    /// Reassembly contract violated (duplicate, wrong datagram, bad sequence)
    InternalError,
    Timeout,
    /// The byte transport failed for a reason other than a timeout
    TransportFailure,
    CrcMismatch,
    /// Frame markers, kind tag or payload length were invalid
    InvalidPacket,
    Flash(FlashError),
    /// The staged or installed image did not check out
    FlashVerificationFailed,
    /// Datagram kind is not accepted in the current DFU state
    BootloaderInvalidState,
    BootloaderUninitialized,
    /// Datagram payload could not be decoded for its kind
    InvalidDatagram,
    /// Firmware chunk arrived with an unexpected id
    SequenceOutOfOrder,
    /// Image is larger than declared or than the flash region
    BinaryOversized,
    /// Control came back from a jump that should never return
    BootloaderFailure,
}

impl FotaError {
    /// Stable numeric code carried on the wire in acknowledgements.
    ///
    /// Zero is reserved for success.
    pub const fn code(&self) -> u32 {
        match self {
            FotaError::ResourceExhausted => 1,
            FotaError::InvalidArgs => 2,
            FotaError::InternalError => 3,
            FotaError::Timeout => 4,
            FotaError::CrcMismatch => 5,
            FotaError::Flash(FlashError::WriteFailed) => 7,
            FotaError::Flash(FlashError::OutOfBounds) => 8,
            FotaError::Flash(FlashError::NotAligned) => 9,
            FotaError::Flash(FlashError::ReadFailed) => 10,
            FotaError::Flash(FlashError::EraseFailed) => 11,
            FotaError::FlashVerificationFailed => 12,
            FotaError::InvalidPacket => 13,
            FotaError::BootloaderInvalidState => 14,
            FotaError::BootloaderUninitialized => 15,
            FotaError::InvalidDatagram => 16,
            FotaError::BootloaderFailure => 18,
            FotaError::SequenceOutOfOrder => 22,
            FotaError::BinaryOversized => 23,
            FotaError::TransportFailure => 24,
        }
    }

    /// Inverse of [`FotaError::code`]. Unknown codes map to `None`.
    pub const fn from_code(code: u32) -> Option<FotaError> {
        let error = match code {
            1 => FotaError::ResourceExhausted,
            2 => FotaError::InvalidArgs,
            3 => FotaError::InternalError,
            4 => FotaError::Timeout,
            5 => FotaError::CrcMismatch,
            7 => FotaError::Flash(FlashError::WriteFailed),
            8 => FotaError::Flash(FlashError::OutOfBounds),
            9 => FotaError::Flash(FlashError::NotAligned),
            10 => FotaError::Flash(FlashError::ReadFailed),
            11 => FotaError::Flash(FlashError::EraseFailed),
            12 => FotaError::FlashVerificationFailed,
            13 => FotaError::InvalidPacket,
            14 => FotaError::BootloaderInvalidState,
            15 => FotaError::BootloaderUninitialized,
            16 => FotaError::InvalidDatagram,
            18 => FotaError::BootloaderFailure,
            22 => FotaError::SequenceOutOfOrder,
            23 => FotaError::BinaryOversized,
            24 => FotaError::TransportFailure,
            _ => return None,
        };
        Some(error)
    }
}

impl From<FlashError> for FotaError {
    fn from(err: FlashError) -> Self {
        FotaError::Flash(err)
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::NotAligned => write!(f, "flash access not aligned"),
            FlashError::OutOfBounds => write!(f, "flash access out of bounds"),
            FlashError::ReadFailed => write!(f, "flash read failed"),
            FlashError::WriteFailed => write!(f, "flash write failed"),
            FlashError::EraseFailed => write!(f, "flash erase failed"),
        }
    }
}

impl fmt::Display for FotaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FotaError::InvalidArgs => write!(f, "invalid arguments"),
            FotaError::ResourceExhausted => write!(f, "resource exhausted"),
            FotaError::InternalError => write!(f, "datagram reassembly rejected the packet"),
            FotaError::Timeout => write!(f, "operation timed out"),
            FotaError::TransportFailure => write!(f, "transport failure"),
            FotaError::CrcMismatch => write!(f, "CRC32 mismatch"),
            FotaError::InvalidPacket => write!(f, "invalid packet"),
            FotaError::Flash(e) => write!(f, "{e}"),
            FotaError::FlashVerificationFailed => write!(f, "flash verification failed"),
            FotaError::BootloaderInvalidState => write!(f, "datagram not valid in current bootloader state"),
            FotaError::BootloaderUninitialized => write!(f, "bootloader not initialised"),
            FotaError::InvalidDatagram => write!(f, "invalid datagram payload"),
            FotaError::SequenceOutOfOrder => write!(f, "firmware chunk out of order"),
            FotaError::BinaryOversized => write!(f, "firmware binary oversized"),
            FotaError::BootloaderFailure => write!(f, "jump returned to the bootloader"),
        }
    }
}
