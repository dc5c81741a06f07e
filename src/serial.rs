// Copyright (C) 2026 The ttyload authors
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::time::Duration;

// ============================================================================
// SerialLink Trait
// ============================================================================

/// The byte channel the upload session runs over. A read that produces no
/// data within `timeout` returns either `Ok(0)` or an error of kind
/// `TimedOut`; callers treat the two the same.
pub trait SerialLink: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial link backed by a real port via the serialport crate. The console
/// transport is always 8N1; only the device path and bit rate vary.
pub struct RealSerialPort {
    port: Box<dyn SerialPort>,
}

impl RealSerialPort {
    pub fn open(port_name: &str, bitrate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, bitrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_secs(1))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialLink for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(std::io::Error::other)?;
        self.port.read(buf)
    }
}

// ============================================================================
// Mock Serial Link for Testing
// ============================================================================

/// Scripted link for session tests. Reads are served from a byte script in
/// which `None` stands for one silent read-timeout interval; the mock sleeps
/// for the requested timeout before reporting it, so deadline-based waits
/// see real time pass. Writes are logged and checked against the expected
/// transcript when the mock is dropped.
#[cfg(test)]
pub struct MockSerialLink {
    responses: Vec<Option<u8>>,
    read_pos: usize,
    write_log: Vec<u8>,
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialLink {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialLink {
            responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }
}

#[cfg(test)]
impl SerialLink for MockSerialLink {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        // Script exhausted: permanent silence, but without sleeping so that
        // drop-time drains stay fast.
        if self.read_pos >= self.responses.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "script exhausted",
            ));
        }

        if self.responses[self.read_pos].is_none() {
            self.read_pos += 1;
            std::thread::sleep(timeout);
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "scripted silence",
            ));
        }

        let mut n = 0;
        while n < buf.len() && self.read_pos < self.responses.len() {
            match self.responses[self.read_pos] {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                    self.read_pos += 1;
                }
                None => break,
            }
        }

        Ok(n)
    }
}

#[cfg(test)]
impl Drop for MockSerialLink {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        // Every scripted data byte must have been consumed. Trailing silence
        // entries may be left over - deadline expiry depends on wall-clock
        // sleeps and can trip before the script runs dry.
        let unread: Vec<u8> = self.responses[self.read_pos..]
            .iter()
            .flatten()
            .copied()
            .collect();
        assert!(
            unread.is_empty(),
            "MockSerialLink dropped with {} unconsumed data bytes: {:02X?}",
            unread.len(),
            unread
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialLink write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}
