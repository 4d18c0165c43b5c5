use serde_derive::Serialize;

//------------ Identity ------------------------------------------------------

/// The first numeric identity the local allocator may hand out. Everything
/// below this value is reserved for well-known identities.
pub const LOCAL_IDENTITY_BASE: u32 = 0x0100_0000;

/// The fixed identity of the local host. Its numeric value never changes,
/// but the labels attached to it are mutable and track the union of all
/// host prefixes.
pub const IDENTITY_HOST: Identity = Identity(1);

/// A numeric security identity.
///
/// Small integer attached to a prefix, consumed by the policy engine and
/// the datapath maps.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Identity(pub u32);

impl Identity {
    /// Whether this identity comes from the locally scoped range managed
    /// by the identity allocator.
    pub fn is_local(self) -> bool {
        self.0 >= LOCAL_IDENTITY_BASE
    }

    pub fn is_reserved_host(self) -> bool {
        self == IDENTITY_HOST
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Identity {
    fn from(value: u32) -> Self {
        Identity(value)
    }
}
