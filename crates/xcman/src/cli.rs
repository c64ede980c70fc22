use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// xcman - keeps XCTrack, XCGuide and the XC Manager app current on a
/// phone connected over adb
#[derive(Debug, Parser)]
#[command(name = "xcman", version, about)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Keep settings, state and downloads under this directory instead of
    /// the per-user application directories
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check the manifest now and list installed and available versions
    Check,

    /// Show the last check result and the reminder schedule
    Status,

    /// Mark a package for the next `upgrade` (or unmark it with --off)
    Select {
        /// Package id, e.g. org.xcontest.XCTrack
        package: String,

        #[arg(long)]
        off: bool,
    },

    /// Download and install selected packages, or the ones given
    Upgrade {
        /// Package ids to upgrade; defaults to the selection
        packages: Vec<String>,
    },

    /// Turn on update reminders every DAYS/HOURS/MINUTES
    Schedule {
        #[arg(long, default_value_t = 0)]
        days: u32,

        #[arg(long, default_value_t = 0)]
        hours: u32,

        #[arg(long, default_value_t = 0)]
        minutes: u32,
    },

    /// Turn off update reminders
    Disable,

    /// Show, set or clear the device model used to pick manager builds
    Model {
        /// Model name, e.g. SM-S901B
        name: Option<String>,

        #[arg(long, conflicts_with = "name")]
        clear: bool,
    },

    /// Run a check if one is due (the body of each periodic trigger)
    Tick,

    /// Stay running and check whenever the reminder interval elapses
    Watch,

    /// Re-register the reminder after a reboot and keep running
    Boot,
}

impl Commands {
    /// Whether the command runs the check or download flow. Only those take
    /// the single-instance lock; the rest only read or write persisted state.
    pub fn needs_instance_lock(&self) -> bool {
        matches!(
            self,
            Self::Check | Self::Upgrade { .. } | Self::Tick | Self::Watch | Self::Boot
        )
    }
}
