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

//! Byte level plumbing between a link driver and the packet manager.
//!
//! The driver (a UART interrupt, a USB task) owns the [`NetworkProducer`] and
//! pushes bytes as they arrive. The polling loop owns the [`NetworkReader`].
//! The queue underneath is lock free single producer single consumer, so the
//! two halves may live in different execution contexts.

use embedded_io::{ErrorKind, ErrorType, Read, Write};
use heapless::spsc::{Consumer, Producer, Queue};

use crate::TRANSPORT_TIMEOUT_MS;
use crate::error::FotaError;

/// Millisecond time source.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

impl<C: Clock> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Bounded receive queue. Holds `N - 1` bytes.
pub struct NetworkBuffer<const N: usize> {
    queue: Queue<u8, N>,
}

impl<const N: usize> NetworkBuffer<N> {
    pub const fn new() -> Self {
        Self { queue: Queue::new() }
    }

    /// Splits the buffer into its producer and a reader using the default
    /// per read timeout.
    pub fn split<C: Clock>(&mut self, clock: C) -> (NetworkProducer<'_, N>, NetworkReader<'_, C, N>) {
        let (producer, consumer) = self.queue.split();
        (
            NetworkProducer { producer },
            NetworkReader {
                consumer,
                clock,
                timeout_ms: TRANSPORT_TIMEOUT_MS,
            },
        )
    }
}

impl<const N: usize> Default for NetworkBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NetworkProducer<'a, const N: usize> {
    producer: Producer<'a, u8, N>,
}

impl<const N: usize> NetworkProducer<'_, N> {
    /// # Errors
    ///
    /// - `ResourceExhausted`: the queue is full and the byte was dropped
    pub fn push(&mut self, byte: u8) -> Result<(), FotaError> {
        self.producer.enqueue(byte).map_err(|_| FotaError::ResourceExhausted)
    }

    /// Pushes as much of `bytes` as fits.
    ///
    /// # Errors
    ///
    /// - `ResourceExhausted`: the queue filled up, the remaining bytes were dropped
    pub fn push_slice(&mut self, bytes: &[u8]) -> Result<(), FotaError> {
        for (index, byte) in bytes.iter().enumerate() {
            if self.push(*byte).is_err() {
                log::warn!("Network buffer full, dropped {} bytes", bytes.len() - index);
                return Err(FotaError::ResourceExhausted);
            }
        }
        Ok(())
    }

    pub fn free_space(&self) -> usize {
        self.producer.capacity() - self.producer.len()
    }
}

pub struct NetworkReader<'a, C: Clock, const N: usize> {
    consumer: Consumer<'a, u8, N>,
    clock: C,
    timeout_ms: u64,
}

impl<C: Clock, const N: usize> NetworkReader<'_, C, N> {
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Bytes waiting in the queue.
    pub fn available(&self) -> usize {
        self.consumer.len()
    }

    /// Drops queued bytes up to, not including, the next `marker`. Stops at
    /// an empty queue. Returns how many bytes went.
    pub fn discard_until(&mut self, marker: u8) -> usize {
        let mut dropped = 0;
        while let Some(byte) = self.consumer.peek() {
            if *byte == marker {
                break;
            }
            let _ = self.consumer.dequeue();
            dropped += 1;
        }
        dropped
    }
}

impl<C: Clock, const N: usize> ErrorType for NetworkReader<'_, C, N> {
    type Error = ErrorKind;
}

impl<C: Clock, const N: usize> Read for NetworkReader<'_, C, N> {
    /// Waits up to the configured timeout for the first byte, then returns
    /// whatever is queued without waiting further.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorKind> {
        if buf.is_empty() {
            return Ok(0);
        }

        let start = self.clock.now_ms();
        let first = loop {
            if let Some(byte) = self.consumer.dequeue() {
                break byte;
            }
            if self.clock.now_ms().saturating_sub(start) >= self.timeout_ms {
                return Err(ErrorKind::TimedOut);
            }
            core::hint::spin_loop();
        };

        buf[0] = first;
        let mut count = 1;
        while count < buf.len() {
            match self.consumer.dequeue() {
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

/// Pairs a reader with a writer so the two can be handed around as one
/// transport. Errors from either side are reduced to their kind.
pub struct Link<R, W> {
    pub reader: R,
    pub writer: W,
}

impl<R, W> Link<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R, W> ErrorType for Link<R, W> {
    type Error = ErrorKind;
}

impl<R: Read, W> Read for Link<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorKind> {
        self.reader.read(buf).map_err(|e| embedded_io::Error::kind(&e))
    }
}

impl<R, W: Write> Write for Link<R, W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
        self.writer.write(buf).map_err(|e| embedded_io::Error::kind(&e))
    }

    fn flush(&mut self) -> Result<(), ErrorKind> {
        self.writer.flush().map_err(|e| embedded_io::Error::kind(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ManualClock;

    #[test]
    fn reader_returns_queued_bytes() {
        let clock = ManualClock::new();
        let mut buffer: NetworkBuffer<16> = NetworkBuffer::new();
        let (mut producer, mut reader) = buffer.split(&clock);

        producer.push_slice(&[1, 2, 3]).unwrap();
        assert_eq!(reader.available(), 3);

        let mut out = [0u8; 8];
        assert_eq!(reader.read(&mut out), Ok(3));
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(reader.available(), 0);
    }

    #[test]
    fn empty_reader_times_out() {
        let clock = ManualClock::ticking(1);
        let mut buffer: NetworkBuffer<16> = NetworkBuffer::new();
        let (_producer, mut reader) = buffer.split(&clock);

        let mut out = [0u8; 4];
        assert_eq!(reader.read(&mut out), Err(ErrorKind::TimedOut));
        assert!(clock.now_ms() >= TRANSPORT_TIMEOUT_MS);
    }

    #[test]
    fn discard_until_stops_at_marker() {
        let clock = ManualClock::new();
        let mut buffer: NetworkBuffer<16> = NetworkBuffer::new();
        let (mut producer, mut reader) = buffer.split(&clock);

        producer.push_slice(&[0x00, 0x13, 0xAA, 0x01]).unwrap();
        assert_eq!(reader.discard_until(0xAA), 2);
        assert_eq!(reader.discard_until(0xAA), 0);
        assert_eq!(reader.available(), 2);

        let mut out = [0u8; 4];
        assert_eq!(reader.read(&mut out), Ok(2));
        assert_eq!(&out[..2], &[0xAA, 0x01]);

        producer.push_slice(&[7, 8, 9]).unwrap();
        assert_eq!(reader.discard_until(0xAA), 3);
        assert_eq!(reader.available(), 0);
    }

    #[test]
    fn full_queue_drops_bytes() {
        let clock = ManualClock::new();
        let mut buffer: NetworkBuffer<4> = NetworkBuffer::new();
        let (mut producer, mut reader) = buffer.split(&clock);

        assert_eq!(producer.push_slice(&[1, 2, 3, 4, 5]), Err(FotaError::ResourceExhausted));
        assert_eq!(producer.free_space(), 0);

        let mut out = [0u8; 8];
        assert_eq!(reader.read(&mut out), Ok(3));
        assert_eq!(&out[..3], &[1, 2, 3]);
    }
}
