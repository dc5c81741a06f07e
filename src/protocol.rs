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

//! Wire constants and the STX/ETX/DLE framer

/// Start of text - opens a frame
pub const STX: u8 = 0x02;

/// End of text - closes a frame and ends the transfer
pub const ETX: u8 = 0x03;

/// Data link escape - escapes the byte that follows it
pub const DLE: u8 = 0x10;

/// Console interrupt (^C); the same byte as ETX, sent twice during
/// synchronization to cancel whatever the remote console is doing
pub const INTERRUPT: u8 = 0x03;

/// Idle prompt of the remote console; also emitted by the receiver as a
/// fake prompt once per full block, which we treat as the acknowledgement
pub const PROMPT: &[u8] = b"> ";

/// Prefix of any error report the remote console prints while evaluating
pub const ERROR_MARKER: &[u8] = b"Lua error:";

/// Command echoed back by a responsive console during synchronization
pub const SYNC_COMMAND: &[u8] = b"print('sync')";
pub const SYNC_MARKER: &[u8] = b"sync";

/// Emitted by the receiver program once its byte handler is armed
pub const READY_MARKER: &[u8] = b"ready";

/// Emitted by the receiver program after closing the destination file
pub const DONE_MARKER: &[u8] = b"done";

/// Wrap a payload in STX/ETX framing, escaping every literal STX, ETX or
/// DLE byte with a preceding DLE. The escape applies to all payload bytes,
/// not just delimiter collisions - the remote decoder treats any unescaped
/// STX/ETX/DLE specially regardless of position.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(STX);
    for &b in payload {
        if b == STX || b == ETX || b == DLE {
            out.push(DLE);
        }
        out.push(b);
    }
    out.push(ETX);
    out
}

// ============================================================================
// Tests
// ============================================================================
