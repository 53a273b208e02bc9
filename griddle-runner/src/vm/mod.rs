//! Virtual-machine sessions and the interrupt watchdog.

mod session;
mod watchdog;

pub use session::*;
pub use watchdog::*;

use std::{fmt, str::FromStr};
use thiserror::Error;

/// The guest architecture a session boots.
///
/// Selects both the QEMU system binary and the register the guest reports
/// its synchronization codes in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// 32-bit x86.
    X86,
}

impl Arch {
    /// The QEMU system emulator binary for this architecture.
    pub fn qemu_system(self) -> &'static str {
        match self {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::X86 => "qemu-system-i386",
        }
    }

    /// The register carrying the guest's synchronization code.
    pub fn return_register(self) -> &'static str {
        match self {
            Arch::X86_64 => "RAX",
            Arch::X86 => "EAX",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => f.write_str("x86_64"),
            Arch::X86 => f.write_str("x86_32"),
        }
    }
}

/// Error returned while parsing an [`Arch`] from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized architecture: {input} (known values: x86_64, x86_32)")]
pub struct ArchParseError {
    input: String,
}

impl FromStr for Arch {
    type Err = ArchParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Arch::X86_64),
            "x86_32" | "x86" => Ok(Arch::X86),
            _ => Err(ArchParseError {
                input: s.to_owned(),
            }),
        }
    }
}
