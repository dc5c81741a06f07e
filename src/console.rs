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

//! Line-console adapter over a raw serial link.
//!
//! All textual pattern matching against the remote console lives here: the
//! `> ` idle/ack prompt, the `Lua error:` marker, and line-level marker
//! waits. Waits are deadline-based - each one gets a budget of
//! [`WAIT_INTERVALS`] read-timeout intervals measured against a monotonic
//! clock. Dropping the console runs the recovery sequence exactly once, so
//! the remote is not left stuck in non-interactive mode on any exit path.

use crate::protocol::{ERROR_MARKER, ETX, PROMPT};
use crate::serial::SerialLink;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Number of read-timeout intervals a single wait may span.
pub const WAIT_INTERVALS: u32 = 5;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum ConsoleError {
    Io(std::io::Error),
    /// No prompt within the wait budget; carries whatever the remote did
    /// print, as the only diagnostic available.
    PromptTimeout { pending: String },
    /// Expected marker line never arrived within the wait budget.
    MarkerTimeout { marker: String },
    /// The remote console reported an evaluation error; `output` holds the
    /// full error text plus any buffered lines that followed it.
    RemoteError { output: String },
}

impl std::fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleError::Io(e) => write!(f, "I/O error: {}", e),
            ConsoleError::PromptTimeout { pending } => {
                write!(f, "timed out waiting for prompt (got: {:?})", pending)
            }
            ConsoleError::MarkerTimeout { marker } => {
                write!(f, "timed out waiting for \"{}\"", marker)
            }
            ConsoleError::RemoteError { output } => {
                write!(f, "remote error:\n{}", output)
            }
        }
    }
}

impl std::error::Error for ConsoleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsoleError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConsoleError {
    fn from(err: std::io::Error) -> Self {
        ConsoleError::Io(err)
    }
}

/// Whether a wait treats remote error markers as fatal. They are ignored
/// only while synchronizing, where stale output from before the interrupt
/// may still contain old error text.
#[derive(Clone, Copy, PartialEq)]
pub enum ErrorPolicy {
    Ignore,
    Fatal,
}

// ============================================================================
// Console
// ============================================================================

pub struct Console {
    port: Box<dyn SerialLink>,
    read_timeout: Duration,
}

impl Console {
    pub fn new(port: Box<dyn SerialLink>, read_timeout: Duration) -> Self {
        Console { port, read_timeout }
    }

    fn budget(&self) -> Duration {
        self.read_timeout * WAIT_INTERVALS
    }

    pub fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.port.write_all(bytes)
    }

    pub fn send_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.port.write_all(line)?;
        self.port.write_all(b"\n")
    }

    /// Read one byte, mapping a quiet interval to `None`.
    fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.port.read_timeout(&mut byte, self.read_timeout) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read up to and including a newline. Returns what was collected so
    /// far (possibly nothing) as soon as one read interval passes quietly.
    pub fn read_line(&mut self) -> std::io::Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            match self.read_byte()? {
                Some(b) => {
                    line.push(b);
                    if b == b'\n' {
                        return Ok(line);
                    }
                }
                None => return Ok(line),
            }
        }
    }

    /// Wait until the remote prints its `> ` prompt, discarding everything
    /// before it. With [`ErrorPolicy::Fatal`], a `Lua error:` marker in the
    /// discarded output aborts the wait after draining the rest of the
    /// remote's report.
    pub fn wait_prompt(&mut self, policy: ErrorPolicy) -> Result<(), ConsoleError> {
        let deadline = Instant::now() + self.budget();
        let mut pending: Vec<u8> = Vec::new();
        loop {
            if let Some(b) = self.read_byte()? {
                pending.push(b);
            }

            if policy == ErrorPolicy::Fatal && contains(&pending, ERROR_MARKER) {
                self.drain_lines(&mut pending)?;
                return Err(ConsoleError::RemoteError {
                    output: String::from_utf8_lossy(&pending).into_owned(),
                });
            }

            if contains(&pending, PROMPT) {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ConsoleError::PromptTimeout {
                    pending: String::from_utf8_lossy(&pending).into_owned(),
                });
            }
        }
    }

    /// Block acknowledgement: the receiver program emits one fake prompt
    /// per full block, so the flow-control wait is a prompt wait. Named
    /// separately so the transfer engine never mentions prompts.
    pub fn wait_ack(&mut self) -> Result<(), ConsoleError> {
        self.wait_prompt(ErrorPolicy::Fatal)
    }

    /// Wait for a line containing `marker`. Non-matching lines are
    /// discarded; error markers are not interpreted here.
    pub fn wait_line(&mut self, marker: &[u8]) -> Result<(), ConsoleError> {
        let deadline = Instant::now() + self.budget();
        loop {
            let line = self.read_line()?;
            if contains(&line, marker) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ConsoleError::MarkerTimeout {
                    marker: String::from_utf8_lossy(marker).into_owned(),
                });
            }
        }
    }

    /// After a remote error, collect whatever else the console has to say
    /// so the whole report reaches the caller.
    fn drain_lines(&mut self, out: &mut Vec<u8>) -> std::io::Result<()> {
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                return Ok(());
            }
            out.extend_from_slice(&line);
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        // Best-effort recovery so an interrupted session does not leave the
        // console stuck in non-interactive mode: two ETX bytes terminate any
        // half-open frame (and double as ^C if the receiver never armed),
        // then a newline and one drained line before the port closes.
        let _ = self.port.write_all(&[ETX, ETX, b'\n']);
        let _ = self.read_line();
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialLink;

    const TICK: Duration = Duration::from_millis(5);

    const RECOVERY: &[u8] = &[ETX, ETX, b'\n'];

    fn console(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Console {
        Console::new(
            Box::new(MockSerialLink::new(responses, expected_writes)),
            TICK,
        )
    }

    fn bytes(data: &[u8]) -> Vec<Option<u8>> {
        data.iter().map(|&b| Some(b)).collect()
    }

    #[test]
    fn test_wait_prompt_discards_leading_output() {
        let mut con = console(bytes(b"booting...\r\n> "), RECOVERY.to_vec());
        con.wait_prompt(ErrorPolicy::Ignore).unwrap();
    }

    #[test]
    fn test_wait_prompt_survives_quiet_intervals() {
        let mut responses = vec![None, None];
        responses.extend(bytes(b"> "));
        let mut con = console(responses, RECOVERY.to_vec());
        con.wait_prompt(ErrorPolicy::Fatal).unwrap();
    }

    #[test]
    fn test_wait_prompt_deadline_expires() {
        let mut con = console(vec![None; 8], RECOVERY.to_vec());
        match con.wait_prompt(ErrorPolicy::Ignore) {
            Err(ConsoleError::PromptTimeout { .. }) => {}
            other => panic!("expected prompt timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_error_marker_aborts_and_drains() {
        let mut con = console(
            bytes(b"Lua error: attempt to call a nil value\nstack traceback\n"),
            RECOVERY.to_vec(),
        );
        match con.wait_prompt(ErrorPolicy::Fatal) {
            Err(ConsoleError::RemoteError { output }) => {
                assert!(output.contains("nil value"));
                assert!(output.contains("stack traceback"));
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_marker_ignored_during_sync() {
        let mut responses = bytes(b"Lua error: stale\n");
        responses.extend(bytes(b"> "));
        let mut con = console(responses, RECOVERY.to_vec());
        con.wait_prompt(ErrorPolicy::Ignore).unwrap();
    }

    #[test]
    fn test_wait_line_skips_non_matching_lines() {
        let mut con = console(bytes(b"noise\nmore noise\nready\n"), RECOVERY.to_vec());
        con.wait_line(b"ready").unwrap();
    }

    #[test]
    fn test_wait_line_deadline_expires() {
        let mut con = console(vec![None; 8], RECOVERY.to_vec());
        match con.wait_line(b"ready") {
            Err(ConsoleError::MarkerTimeout { marker }) => assert_eq!(marker, "ready"),
            other => panic!("expected marker timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_runs_recovery_once() {
        // The expected transcript is the recovery sequence alone; the mock
        // asserts it on drop.
        let con = console(Vec::new(), RECOVERY.to_vec());
        drop(con);
    }
}
