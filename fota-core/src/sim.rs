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

//! Stand-ins for the hardware collaborators so the whole pipeline can run on a
//! development host.

use core::cell::Cell;

use embedded_io::{ErrorKind, ErrorType, Read, Write};
use embedded_storage::nor_flash::{
    ErrorType as FlashErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash, check_erase, check_read, check_write,
};
use heapless::{Deque, Vec};

use crate::error::FotaError;
use crate::jump::{Jump, JumpTarget};
use crate::network::Clock;

const ERASED: u8 = 0xFF;

/// Which flash operation an injected fault should hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOperation {
    Read,
    Write,
    Erase,
}

/// RAM backed NOR flash.
///
/// Erase sets bytes to `0xFF`. A write can only clear bits: programming a 1
/// over a 0 fails, the same way the real part silently would not take it.
pub struct SimulatedFlash<const SIZE: usize, const PAGE: usize> {
    memory: [u8; SIZE],
    fail_next: Option<FlashOperation>,
    fail_skip: usize,
    erase_count: usize,
}

impl<const SIZE: usize, const PAGE: usize> SimulatedFlash<SIZE, PAGE> {
    pub fn new() -> Self {
        Self {
            memory: [ERASED; SIZE],
            fail_next: None,
            fail_skip: 0,
            erase_count: 0,
        }
    }

    /// The next matching operation fails with `NorFlashErrorKind::Other`.
    pub fn fail_next(&mut self, operation: FlashOperation) {
        self.fail_after(operation, 0);
    }

    /// Lets `skip` matching operations through, then fails the one after.
    pub fn fail_after(&mut self, operation: FlashOperation, skip: usize) {
        self.fail_next = Some(operation);
        self.fail_skip = skip;
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Writes straight into the backing store, bypassing NOR rules.
    pub fn preload(&mut self, offset: usize, bytes: &[u8]) {
        self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Pages erased so far.
    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    fn take_fault(&mut self, operation: FlashOperation) -> Result<(), NorFlashErrorKind> {
        if self.fail_next == Some(operation) {
            if self.fail_skip > 0 {
                self.fail_skip -= 1;
                return Ok(());
            }
            self.fail_next = None;
            return Err(NorFlashErrorKind::Other);
        }
        Ok(())
    }
}

impl<const SIZE: usize, const PAGE: usize> Default for SimulatedFlash<SIZE, PAGE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize, const PAGE: usize> FlashErrorType for SimulatedFlash<SIZE, PAGE> {
    type Error = NorFlashErrorKind;
}

impl<const SIZE: usize, const PAGE: usize> ReadNorFlash for SimulatedFlash<SIZE, PAGE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        self.take_fault(FlashOperation::Read)?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.memory[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        SIZE
    }
}

impl<const SIZE: usize, const PAGE: usize> NorFlash for SimulatedFlash<SIZE, PAGE> {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = PAGE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        self.take_fault(FlashOperation::Erase)?;
        self.memory[from as usize..to as usize].fill(ERASED);
        self.erase_count += (to - from) as usize / PAGE;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        self.take_fault(FlashOperation::Write)?;
        let start = offset as usize;
        let target = &mut self.memory[start..start + bytes.len()];
        if target.iter().zip(bytes).any(|(old, new)| new & !old != 0) {
            return Err(NorFlashErrorKind::Other);
        }
        for (old, new) in target.iter_mut().zip(bytes) {
            *old &= *new;
        }
        Ok(())
    }
}

/// Records jump requests instead of performing them.
#[derive(Debug, Default)]
pub struct RecordingJump {
    jumps: Vec<JumpTarget, 8>,
}

impl RecordingJump {
    pub fn new() -> Self {
        Self { jumps: Vec::new() }
    }

    pub fn jumps(&self) -> &[JumpTarget] {
        &self.jumps
    }
}

impl Jump for RecordingJump {
    fn jump(&mut self, target: JumpTarget) -> FotaError {
        let _ = self.jumps.push(target);
        FotaError::BootloaderFailure
    }
}

/// Clock that only moves when told to, or by a fixed step on every reading.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
    step: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::ticking(0)
    }

    /// Every call to `now_ms` advances time by `step` after reading it.
    pub fn ticking(step: u64) -> Self {
        Self {
            now: Cell::new(0),
            step,
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.set(now_ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

/// In memory transport: reads come from bytes fed in by the test, writes are
/// captured for inspection. An empty receive side reads as a timeout.
pub struct LoopbackTransport<const N: usize> {
    rx: Deque<u8, N>,
    tx: Vec<u8, N>,
}

impl<const N: usize> LoopbackTransport<N> {
    pub fn new() -> Self {
        Self {
            rx: Deque::new(),
            tx: Vec::new(),
        }
    }

    /// Queues bytes for the reader. Bytes that do not fit are dropped.
    pub fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            if self.rx.push_back(*byte).is_err() {
                break;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn sent(&self) -> &[u8] {
        &self.tx
    }

    pub fn clear_sent(&mut self) {
        self.tx.clear();
    }
}

impl<const N: usize> Default for LoopbackTransport<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ErrorType for LoopbackTransport<N> {
    type Error = ErrorKind;
}

impl<const N: usize> Read for LoopbackTransport<N> {
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

impl<const N: usize> Write for LoopbackTransport<N> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
        self.tx.extend_from_slice(buf).map_err(|_| ErrorKind::OutOfMemory)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), ErrorKind> {
        Ok(())
    }
}
