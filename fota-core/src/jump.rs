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

use crate::error::FotaError;

/// Where a jump hands control to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JumpTarget {
    /// The image in the active region
    Application,
    /// Restart into this bootloader
    Bootloader,
    /// The chip vendor's ROM or secondary bootloader
    VendorBootloader,
}

/// Transfers execution away from the bootloader.
pub trait Jump {
    /// Never returns when the jump succeeds. If it does return, the value
    /// says why control came back.
    fn jump(&mut self, target: JumpTarget) -> FotaError;
}
