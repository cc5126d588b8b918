//! CLI argument grammar (specification §4.10, command table in §6).

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "elektroid-cli", about = "Transfer samples and presets with MIDI samplers")]
pub struct Opts {
    /// Raise verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Operation,
}

#[derive(Subcommand)]
pub enum Operation {
    /// List reachable devices as `<id> <name>`.
    Ld,
    /// Print backend identity and installed filesystem ids.
    Info {
        device: String,
    },
    /// Print storage stats for a device.
    Df {
        device: String,
    },
    /// List a directory: `<device>[/path]`.
    Ls {
        device_path: String,
    },
    /// Create a directory: `<device>/<path>`.
    Mkdir {
        device_path: String,
    },
    /// Rename/move within the same device.
    Mv {
        src: String,
        dst: String,
    },
    /// Delete `<device>/<path>`.
    Rm {
        device_path: String,
    },
    /// Download `<device>/<src>` into `<local dir>`.
    Dl {
        src: String,
        local_dir: String,
    },
    /// Upload `<local file>` into `<device>/<dst>`.
    Ul {
        local_file: String,
        device_path: String,
    },
}
