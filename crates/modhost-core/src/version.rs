//! Packed runtime versions.

use std::fmt;

/// A `major.minor.patch` version packed as `(major << 16) | (minor << 8) | patch`.
///
/// Ordering of packed values equals ordering of the versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PackedVersion(u32);

impl PackedVersion {
    /// Pack a version.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self(((major as u32) << 16) | ((minor as u32) << 8) | patch as u32)
    }

    /// Wrap an already packed value. Bits above 24 are dropped.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & 0x00ff_ffff)
    }

    /// The packed value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn minor(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn patch(self) -> u8 {
        self.0 as u8
    }

    /// Whether both versions share major and minor.
    pub const fn same_minor_series(self, other: Self) -> bool {
        (self.0 >> 8) == (other.0 >> 8)
    }

    /// Parse `M.m.p`, splitting on `.` and `-`.
    ///
    /// The first three components must be numbers in `0..=255`; anything after
    /// them (a pre-release tag, a fourth component) is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split(['.', '-']);
        let mut next = || parts.next().and_then(|p| p.parse::<u8>().ok());
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        Some(Self::new(major, minor, patch))
    }

    /// Packed value as lowercase hex, the form stored in the plugin cache.
    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }

    /// Inverse of [`to_hex`](Self::to_hex).
    pub fn from_hex(text: &str) -> Option<Self> {
        u32::from_str_radix(text, 16).ok().map(Self::from_raw)
    }
}

impl fmt::Display for PackedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}
