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

//! Upload session state machine.
//!
//! One typestate per protocol phase, strictly forward: Synchronize → SendLoader →
//! AwaitReady → TransmitBlock ⇄ AwaitAck → AwaitDone → Restore. Every
//! failure is terminal; the console's drop guard recovers the remote on the
//! way out regardless of which phase the session died in.

use crate::console::{Console, ConsoleError, ErrorPolicy};
use crate::loader::render_loader;
use crate::protocol::{DONE_MARKER, INTERRUPT, READY_MARKER, SYNC_COMMAND, SYNC_MARKER, encode_frame};
use std::io::Write;
use std::marker::PhantomData;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum UploadError {
    Io(std::io::Error),
    /// Synchronization failed; the device never reached a clean prompt.
    NotResponding,
    /// The remote console reported an evaluation error (full text attached).
    Remote(String),
    /// Prompt lost while sending the receiver program line by line.
    LoaderTimeout,
    /// The receiver program never signalled `ready`.
    ReadyTimeout,
    /// A full block's acknowledgement never arrived. `blocks_sent` counts
    /// the blocks that completed, so the caller knows roughly how far the
    /// transfer got. The block itself is never retried.
    AckTimeout { blocks_sent: usize },
    /// The receiver never confirmed `done`, or the final prompt never came
    /// back; the remote file state is unknown.
    DoneTimeout,
    TransferComplete,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Io(e) => write!(f, "I/O error: {}", e),
            UploadError::NotResponding => write!(f, "device not responding"),
            UploadError::Remote(output) => write!(f, "remote reported an error:\n{}", output),
            UploadError::LoaderTimeout => {
                write!(f, "device stopped responding while sending the loader")
            }
            UploadError::ReadyTimeout => write!(f, "loader never signalled ready"),
            UploadError::AckTimeout { blocks_sent } => {
                write!(f, "failed after sending {} blocks", blocks_sent)
            }
            UploadError::DoneTimeout => {
                write!(f, "transfer timed out; remote file state is unknown")
            }
            UploadError::TransferComplete => write!(f, "transfer complete"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UploadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err)
    }
}

/// Console failures keep their I/O and remote-error identity; timeouts take
/// the phase-specific meaning supplied by the caller.
fn phase_err(e: ConsoleError, timeout: UploadError) -> UploadError {
    match e {
        ConsoleError::Io(io) => UploadError::Io(io),
        ConsoleError::RemoteError { output } => UploadError::Remote(output),
        _ => timeout,
    }
}

// ============================================================================
// States
// ============================================================================

pub struct Synchronize;
pub struct SendLoader;
pub struct AwaitReady;
pub struct TransmitBlock;
pub struct AwaitAck;
pub struct AwaitDone;
pub struct Restore;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct UploadFsm<State> {
    state: PhantomData<State>,
    console: Console,
    loader_lines: Vec<Vec<u8>>,
    line_idx: usize,
    frame: Vec<u8>,
    offset: usize,
    blocksize: usize,
    blocks_sent: usize,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait UploadState {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError>;
}

/// Drive the session to completion. `TransferComplete` is the normal exit.
pub fn run_upload(mut fsm: Box<dyn UploadState>) -> Result<(), UploadError> {
    loop {
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(UploadError::TransferComplete) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> UploadFsm<S> {
    fn transition<T>(self) -> Box<UploadFsm<T>> {
        Box::new(UploadFsm {
            state: PhantomData,
            console: self.console,
            loader_lines: self.loader_lines,
            line_idx: self.line_idx,
            frame: self.frame,
            offset: self.offset,
            blocksize: self.blocksize,
            blocks_sent: self.blocks_sent,
            debug: self.debug,
        })
    }
}

fn progress(msg: &str) {
    print!("{}", msg);
    let _ = std::io::stdout().flush();
}

// ============================================================================
// State Implementations
// ============================================================================

impl UploadState for UploadFsm<Synchronize> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        progress("Synchronising serial...");

        // Two interrupts defeat a single buffered one; stale output and old
        // error text are discarded until the prompt comes back.
        fsm.console.send(&[INTERRUPT, INTERRUPT, b'\n'])?;
        fsm.console
            .wait_prompt(ErrorPolicy::Ignore)
            .map_err(|e| phase_err(e, UploadError::NotResponding))?;

        fsm.console.send_line(SYNC_COMMAND)?;
        fsm.console
            .wait_line(SYNC_MARKER)
            .map_err(|e| phase_err(e, UploadError::NotResponding))?;
        fsm.console
            .wait_prompt(ErrorPolicy::Ignore)
            .map_err(|e| phase_err(e, UploadError::NotResponding))?;

        println!(" ok");
        let next = fsm.transition::<SendLoader>();
        Ok(next as Box<dyn UploadState>)
    }
}

impl UploadState for UploadFsm<SendLoader> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        if fsm.line_idx == 0 {
            progress("Sending loader");
        }

        // One line per step: the remote console cannot buffer more than a
        // line of pasted text, so each one waits for its prompt. An error
        // marker here means the loader failed to evaluate - fatal.
        let line = fsm.loader_lines[fsm.line_idx].clone();
        fsm.console.send_line(&line)?;
        fsm.console
            .wait_prompt(ErrorPolicy::Fatal)
            .map_err(|e| phase_err(e, UploadError::LoaderTimeout))?;
        progress(".");

        fsm.line_idx += 1;
        if fsm.line_idx >= fsm.loader_lines.len() {
            println!(" ok");
            let next = fsm.transition::<AwaitReady>();
            Ok(next as Box<dyn UploadState>)
        } else {
            Ok(Box::new(fsm) as Box<dyn UploadState>)
        }
    }
}

impl UploadState for UploadFsm<AwaitReady> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        progress("Waiting for go-ahead...");

        fsm.console
            .wait_line(READY_MARKER)
            .map_err(|e| phase_err(e, UploadError::ReadyTimeout))?;

        println!(" ok");
        let next = fsm.transition::<TransmitBlock>();
        Ok(next as Box<dyn UploadState>)
    }
}

impl UploadState for UploadFsm<TransmitBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        if fsm.offset == 0 {
            progress(&format!(
                "Sending file contents (blocksize {})",
                fsm.blocksize
            ));
        }

        if fsm.offset >= fsm.frame.len() {
            println!(" ok, sent {} blocks", fsm.blocks_sent);
            let next = fsm.transition::<AwaitDone>();
            return Ok(next as Box<dyn UploadState>);
        }

        let end = usize::min(fsm.offset + fsm.blocksize, fsm.frame.len());
        let full = end - fsm.offset == fsm.blocksize;
        let block = fsm.frame[fsm.offset..end].to_vec();
        fsm.console.send(&block)?;
        fsm.offset = end;
        if fsm.debug {
            println!("Sent block {} ({} bytes)", fsm.blocks_sent + 1, block.len());
        }

        if full {
            let next = fsm.transition::<AwaitAck>();
            Ok(next as Box<dyn UploadState>)
        } else {
            // The receiver only prompts after a full block's worth of
            // bytes, so a short tail is never acknowledged.
            fsm.blocks_sent += 1;
            progress(".");
            Ok(Box::new(fsm) as Box<dyn UploadState>)
        }
    }
}

impl UploadState for UploadFsm<AwaitAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        let blocks_sent = fsm.blocks_sent;
        fsm.console
            .wait_ack()
            .map_err(|e| phase_err(e, UploadError::AckTimeout { blocks_sent }))?;
        fsm.blocks_sent += 1;
        progress(".");

        let next = fsm.transition::<TransmitBlock>();
        Ok(next as Box<dyn UploadState>)
    }
}

impl UploadState for UploadFsm<AwaitDone> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        progress("Waiting for final ack...");

        fsm.console
            .wait_line(DONE_MARKER)
            .map_err(|e| phase_err(e, UploadError::DoneTimeout))?;
        fsm.console.send(b"\n")?;

        let next = fsm.transition::<Restore>();
        Ok(next as Box<dyn UploadState>)
    }
}

impl UploadState for UploadFsm<Restore> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        fsm.console
            .wait_prompt(ErrorPolicy::Fatal)
            .map_err(|e| phase_err(e, UploadError::DoneTimeout))?;

        println!(" ok");
        Err(UploadError::TransferComplete)
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl UploadFsm<Synchronize> {
    pub fn new(
        console: Console,
        payload: &[u8],
        name: &str,
        blocksize: usize,
        debug: bool,
    ) -> Box<dyn UploadState> {
        Box::new(UploadFsm {
            state: PhantomData::<Synchronize>,
            console,
            loader_lines: render_loader(name, blocksize),
            line_idx: 0,
            frame: encode_frame(payload),
            offset: 0,
            blocksize,
            blocks_sent: 0,
            debug,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ETX, PROMPT};
    use crate::serial::MockSerialLink;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(5);

    const RECOVERY: &[u8] = &[ETX, ETX, b'\n'];

    fn bytes(data: &[u8]) -> Vec<Option<u8>> {
        data.iter().map(|&b| Some(b)).collect()
    }

    /// Responses covering a successful synchronization.
    fn sync_responses() -> Vec<Option<u8>> {
        let mut r = bytes(PROMPT);
        r.extend(bytes(b"sync\n"));
        r.extend(bytes(PROMPT));
        r
    }

    /// What a successful synchronization writes to the link.
    fn sync_writes() -> Vec<u8> {
        let mut w = vec![INTERRUPT, INTERRUPT, b'\n'];
        w.extend_from_slice(SYNC_COMMAND);
        w.push(b'\n');
        w
    }

    /// One prompt per loader line, and the lines themselves on the write
    /// side, for a given destination name and block size.
    fn loader_exchange(name: &str, blocksize: usize) -> (Vec<Option<u8>>, Vec<u8>) {
        let mut responses = Vec::new();
        let mut writes = Vec::new();
        for line in render_loader(name, blocksize) {
            responses.extend(bytes(PROMPT));
            writes.extend_from_slice(&line);
            writes.push(b'\n');
        }
        (responses, writes)
    }

    fn new_session(
        responses: Vec<Option<u8>>,
        expected_writes: Vec<u8>,
        payload: &[u8],
        name: &str,
        blocksize: usize,
    ) -> Box<dyn UploadState> {
        let console = Console::new(
            Box::new(MockSerialLink::new(responses, expected_writes)),
            TICK,
        );
        UploadFsm::new(console, payload, name, blocksize, false)
    }

    #[test]
    fn test_full_upload_with_short_final_block() {
        // 200 bytes of 0x41 frame to 202; blocksize 80 gives two full
        // blocks (each acknowledged) and a 42-byte tail sent without
        // waiting. The mock transcript only contains two ack prompts, so
        // any extra wait would fail the run.
        let payload = vec![0x41u8; 200];
        let frame = encode_frame(&payload);
        assert_eq!(frame.len(), 202);

        let mut responses = sync_responses();
        let (loader_resp, loader_writes) = loader_exchange("data.bin", 80);
        responses.extend(loader_resp);
        responses.extend(bytes(b"ready\n"));
        responses.extend(bytes(PROMPT)); // ack for block 1
        responses.extend(bytes(PROMPT)); // ack for block 2
        responses.extend(bytes(b"done\n"));
        responses.extend(bytes(PROMPT)); // interactive prompt restored

        let mut writes = sync_writes();
        writes.extend(loader_writes);
        writes.extend_from_slice(&frame);
        writes.push(b'\n');
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, &payload, "data.bin", 80);
        run_upload(fsm).expect("upload should succeed");
    }

    #[test]
    fn test_full_final_block_is_acknowledged() {
        // Frame length an exact multiple of the block size: every block is
        // full, so every block including the last one waits for an ack.
        let payload = vec![0x55u8; 158];
        let frame = encode_frame(&payload);
        assert_eq!(frame.len(), 160);

        let mut responses = sync_responses();
        let (loader_resp, loader_writes) = loader_exchange("even.bin", 80);
        responses.extend(loader_resp);
        responses.extend(bytes(b"ready\n"));
        responses.extend(bytes(PROMPT));
        responses.extend(bytes(PROMPT));
        responses.extend(bytes(b"done\n"));
        responses.extend(bytes(PROMPT));

        let mut writes = sync_writes();
        writes.extend(loader_writes);
        writes.extend_from_slice(&frame);
        writes.push(b'\n');
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, &payload, "even.bin", 80);
        run_upload(fsm).expect("upload should succeed");
    }

    #[test]
    fn test_sync_timeout_reports_not_responding() {
        // Silence from the device: synchronization must fail within its
        // deadline, and recovery still runs on the way out.
        let responses = vec![None; 8];
        let mut writes = vec![INTERRUPT, INTERRUPT, b'\n'];
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, b"payload", "x.bin", 80);
        match run_upload(fsm) {
            Err(UploadError::NotResponding) => {}
            other => panic!("expected NotResponding, got {:?}", other),
        }
    }

    #[test]
    fn test_remote_error_during_loader_aborts() {
        let mut responses = sync_responses();
        // First loader line draws an error report instead of a prompt.
        responses.extend(bytes(b"Lua error: unexpected symbol\nstack traceback\n"));

        let mut writes = sync_writes();
        let loader_lines = render_loader("x.bin", 80);
        writes.extend_from_slice(&loader_lines[0]);
        writes.push(b'\n');
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, b"payload", "x.bin", 80);
        match run_upload(fsm) {
            Err(UploadError::Remote(output)) => {
                assert!(output.contains("unexpected symbol"));
                assert!(output.contains("stack traceback"));
            }
            other => panic!("expected Remote, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_ready_sends_no_blocks() {
        // The loader installs but never signals ready: no payload bytes may
        // go out, and the recovery sequence must still run.
        let mut responses = sync_responses();
        let (loader_resp, loader_writes) = loader_exchange("x.bin", 80);
        responses.extend(loader_resp);
        responses.extend(vec![None; 8]);

        let mut writes = sync_writes();
        writes.extend(loader_writes);
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, b"payload", "x.bin", 80);
        match run_upload(fsm) {
            Err(UploadError::ReadyTimeout) => {}
            other => panic!("expected ReadyTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_timeout_reports_blocks_sent() {
        // Five full blocks; acks arrive for the first two, then the device
        // goes quiet. Block 3 is on the wire when the wait expires, so the
        // session reports two completed blocks and retries nothing.
        let payload = vec![0x41u8; 18];
        let frame = encode_frame(&payload);
        assert_eq!(frame.len(), 20);

        let mut responses = sync_responses();
        let (loader_resp, loader_writes) = loader_exchange("x.bin", 4);
        responses.extend(loader_resp);
        responses.extend(bytes(b"ready\n"));
        responses.extend(bytes(PROMPT));
        responses.extend(bytes(PROMPT));
        responses.extend(vec![None; 8]);

        let mut writes = sync_writes();
        writes.extend(loader_writes);
        writes.extend_from_slice(&frame[..12]);
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, &payload, "x.bin", 4);
        match run_upload(fsm) {
            Err(UploadError::AckTimeout { blocks_sent: 2 }) => {}
            other => panic!("expected AckTimeout after 2 blocks, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_done_is_fatal() {
        let payload = vec![0x41u8; 10];
        let frame = encode_frame(&payload);

        let mut responses = sync_responses();
        let (loader_resp, loader_writes) = loader_exchange("x.bin", 80);
        responses.extend(loader_resp);
        responses.extend(bytes(b"ready\n"));
        responses.extend(vec![None; 8]);

        let mut writes = sync_writes();
        writes.extend(loader_writes);
        writes.extend_from_slice(&frame);
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, &payload, "x.bin", 80);
        match run_upload(fsm) {
            Err(UploadError::DoneTimeout) => {}
            other => panic!("expected DoneTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_single_byte_blocksize() {
        // Degenerate but legal: every frame byte is its own full block and
        // every one of them is acknowledged.
        let payload = b"ab";
        let frame = encode_frame(payload);
        assert_eq!(frame.len(), 4);

        let mut responses = sync_responses();
        let (loader_resp, loader_writes) = loader_exchange("x.bin", 1);
        responses.extend(loader_resp);
        responses.extend(bytes(b"ready\n"));
        for _ in 0..4 {
            responses.extend(bytes(PROMPT));
        }
        responses.extend(bytes(b"done\n"));
        responses.extend(bytes(PROMPT));

        let mut writes = sync_writes();
        writes.extend(loader_writes);
        writes.extend_from_slice(&frame);
        writes.push(b'\n');
        writes.extend_from_slice(RECOVERY);

        let fsm = new_session(responses, writes, payload, "x.bin", 1);
        run_upload(fsm).expect("upload should succeed");
    }
}
