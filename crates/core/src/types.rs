//! Common types used throughout the workspace

use serde::{Deserialize, Serialize};

/// Represents a memory address (supports both 32 and 64 bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    pub const ZERO: Address = Address(0);

    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_u32(&self) -> u32 {
        self.0 as u32
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn offset(&self, offset: i64) -> Self {
        Self(self.0.wrapping_add_signed(offset))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value as u64)
    }
}

/// Architecture type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86,
    X64,
    Arm32,
    Arm64,
    Wasm32,
    Unknown,
}

impl Architecture {
    pub fn pointer_size(&self) -> usize {
        match self {
            Architecture::X86 | Architecture::Arm32 | Architecture::Wasm32 => 4,
            Architecture::X64 | Architecture::Arm64 => 8,
            Architecture::Unknown => 8,
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, Architecture::X64 | Architecture::Arm64)
    }
}

/// Binary format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryFormat {
    PE,
    ELF,
    MachO,
    NSO,
    WebAssembly,
    Unknown,
}

/// Operating system the recovery is running on.
///
/// Some recovery paths only exist on a particular host, so the locator
/// consults this rather than the format of the image being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPlatform {
    Windows,
    Other,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostPlatform::Windows
        } else {
            HostPlatform::Other
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::current()
    }
}
