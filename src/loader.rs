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

//! The receiver program installed on the remote device.
//!
//! Sent as source text, one line at a time, and evaluated by the remote
//! console. Once running it takes the console out of interactive mode,
//! prints `ready`, and consumes the framed byte stream: an unescaped STX
//! opens the frame, DLE escapes the next byte, an unescaped ETX closes the
//! frame. Everything in between goes to the destination file. For every
//! @BLOCKSIZE@ bytes received it prints a fake `> ` prompt, which the host
//! side uses as a block acknowledgement. On ETX it closes the file,
//! restores interactive mode and prints `done`.

const LOADER: &str = r#"
(function()
  local function frame_receiver(chunk_cb)
    local inframe = false
    local escaped = false
    local done = false
    local len = 0
    local STX = 2
    local ETX = 3
    local DLE = 16
    local function dispatch(data, i, j)
      if (j - i) < 0 then return end
      chunk_cb(data:sub(i, j))
    end
    return function(data)
      if done then return end
      len = len + #data
      while len >= @BLOCKSIZE@ do
        len = len - @BLOCKSIZE@
        console.write("> ")
      end
      local from
      local to
      for i = 1, #data
      do
        local b = data:byte(i)
        if inframe
        then
          if not from then from = i end
          if escaped then escaped = false else
            if b == DLE
            then
              escaped = true
              dispatch(data, from, i-1)
              from = nil
            elseif b == ETX
            then
              done = true
              to = i-1
              break
            end
          end
        else
          if b == DLE then escaped = true
          elseif b == STX and not escaped then inframe = true
          else escaped = false end
        end
      end
      if from then dispatch(data, from, to or #data) end
      if done then chunk_cb(nil) end
    end
  end

  local function file_sink(name)
    local f = io.open(name, "w")
    return function(chunk)
      if chunk then f:write(chunk) else
        f:close()
        console.on("data", 0, nil)
        console.mode(console.INTERACTIVE)
        console.write("done")
      end
    end
  end

  console.on("data", 0, frame_receiver(file_sink(
    "@FILENAME@")))
  console.mode(console.NONINTERACTIVE)
  console.write("ready")
end)()
"#;

/// Substitute the destination name and block size into the receiver source
/// and split it into the lines to be sent. Empty lines are kept - each one
/// still has to be echoed with a prompt by the remote console.
pub fn render_loader(name: &str, blocksize: usize) -> Vec<Vec<u8>> {
    LOADER
        .replace("@FILENAME@", name)
        .replace("@BLOCKSIZE@", &blocksize.to_string())
        .split('\n')
        .map(|line| line.as_bytes().to_vec())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_substituted() {
        let lines = render_loader("init.lua", 80);
        let joined: Vec<u8> = lines.join(&b'\n');
        let text = String::from_utf8(joined).unwrap();
        assert!(text.contains("\"init.lua\""));
        assert!(text.contains("len >= 80 do"));
        assert!(!text.contains('@'));
    }

    #[test]
    fn test_line_split_keeps_blank_lines() {
        let lines = render_loader("x", 1);
        // Leading and trailing newlines in the source produce empty lines
        // that are sent (and acknowledged) like any other.
        assert!(lines.first().unwrap().is_empty());
        assert!(lines.last().unwrap().is_empty());
        assert!(lines.len() > 10);
    }
}
