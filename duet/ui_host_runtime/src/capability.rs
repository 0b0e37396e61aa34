use crate::error::CapabilityError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SdkVersion {
    pub major: u32,
    pub minor: u32,
}

impl SdkVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for SdkVersion {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.trim().split('.');
        let major = parts
            .next()
            .and_then(|part| part.parse::<u32>().ok())
            .ok_or_else(|| format!("invalid sdk version '{raw}'"))?;
        let minor = match parts.next() {
            Some(part) => part
                .parse::<u32>()
                .map_err(|_| format!("invalid sdk version '{raw}'"))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    Background,
    Main,
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadRole::Background => f.write_str("background"),
            ThreadRole::Main => f.write_str("main"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    RunOnMainThread,
    RunOnBackground,
}

impl Capability {
    pub fn min_version(self) -> SdkVersion {
        match self {
            Capability::RunOnMainThread => SdkVersion::new(2, 14),
            Capability::RunOnBackground => SdkVersion::new(2, 16),
        }
    }

    /// The only thread the primitive may be called from.
    pub fn caller_thread(self) -> ThreadRole {
        match self {
            Capability::RunOnMainThread => ThreadRole::Background,
            Capability::RunOnBackground => ThreadRole::Main,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::RunOnMainThread => f.write_str("runOnMainThread"),
            Capability::RunOnBackground => f.write_str("runOnBackground"),
        }
    }
}

/// Hook consulted by every cross-thread call site before dispatching.
pub trait CapabilityGate {
    fn check(&self, capability: Capability, thread: ThreadRole) -> Result<(), CapabilityError>;
}

/// Gate that decides by comparing the host runtime version against the
/// minimum version of each capability.
#[derive(Debug, Clone, Copy)]
pub struct SdkVersionGate {
    pub version: SdkVersion,
}

impl SdkVersionGate {
    pub fn new(version: SdkVersion) -> Self {
        Self { version }
    }
}

impl CapabilityGate for SdkVersionGate {
    fn check(&self, capability: Capability, thread: ThreadRole) -> Result<(), CapabilityError> {
        if thread != capability.caller_thread() {
            return Err(CapabilityError::WrongThread { capability, thread });
        }

        let required = capability.min_version();
        if self.version < required {
            return Err(CapabilityError::Unsupported {
                capability,
                required,
                actual: self.version,
            });
        }

        Ok(())
    }
}
