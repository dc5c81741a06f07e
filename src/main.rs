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

// Binary file upload over a line-oriented serial console
mod console;
mod loader;
mod protocol;
mod serial;
mod uploader;

use clap::Parser;
use console::Console;
use serial::RealSerialPort;
use std::path::PathBuf;
use std::time::Duration;
use uploader::{UploadFsm, run_upload};

#[derive(Parser)]
#[command(name = "ttyload")]
#[command(about = "Upload a file to a device over its serial console", long_about = None)]
struct Cli {
    /// File to read data from
    file: PathBuf,

    /// Name to upload the file as (default: the source file's base name)
    name: Option<String>,

    /// Serial port
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Bit rate
    #[arg(short, long, default_value = "115200")]
    bitrate: u32,

    /// Block size of file data, tweak for speed/reliability of upload
    #[arg(short = 's', long, default_value = "80")]
    blocksize: usize,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

/// Per-read timeout of the console link; a wait spans five of these.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

fn upload_name(cli: &Cli) -> String {
    if let Some(name) = &cli.name {
        return name.clone();
    }
    cli.file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.file.to_string_lossy().into_owned())
}

fn main() {
    let cli = Cli::parse();

    if cli.blocksize == 0 {
        eprintln!("Error: block size must be at least 1");
        std::process::exit(1);
    }

    let name = upload_name(&cli);

    let data = match std::fs::read(&cli.file) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error reading file {}: {}", cli.file.display(), e);
            std::process::exit(1);
        }
    };
    println!("Loaded {} bytes of file contents", data.len());

    let port = match RealSerialPort::open(&cli.port, cli.bitrate) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Error opening serial port {}: {}", cli.port, e);
            std::process::exit(1);
        }
    };

    println!("Uploading \"{}\" as \"{}\"", cli.file.display(), name);

    let console = Console::new(Box::new(port), READ_TIMEOUT);
    let fsm = UploadFsm::new(console, &data, &name, cli.blocksize, cli.debug);

    if let Err(e) = run_upload(fsm) {
        eprintln!("\nUpload failed: {}", e);
        std::process::exit(1);
    }

    println!("Upload complete.");
}
