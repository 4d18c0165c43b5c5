use std::net::IpAddr;

use inetnum::addr::Prefix;

use super::af::AddressFamily;

//------------ ClusterId -----------------------------------------------------

/// Non-negative integer namespacing prefixes across cluster-mesh members.
pub type ClusterId = u32;

/// The cluster ID of the local cluster.
pub const LOCAL_CLUSTER: ClusterId = 0;

//------------ PrefixCluster -------------------------------------------------

/// The cache key: an IP prefix qualified by the cluster it was observed in.
///
/// Constructed in canonical form: host bits are zeroed and IPv4-mapped
/// IPv6 prefixes are unmapped to their IPv4 equivalent. All lookups
/// canonicalize through this constructor, so two spellings of the same
/// prefix always hit the same entry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PrefixCluster {
    prefix: Prefix,
    cluster_id: ClusterId,
}

impl PrefixCluster {
    pub fn new(prefix: Prefix, cluster_id: ClusterId) -> Self {
        PrefixCluster {
            prefix: canonical(prefix),
            cluster_id,
        }
    }

    /// A host route for a single address in the given cluster.
    pub fn from_addr(addr: IpAddr, cluster_id: ClusterId) -> Self {
        let len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        match Prefix::new(addr, len) {
            Ok(prefix) => PrefixCluster::new(prefix, cluster_id),
            // A full-length prefix has no host bits to reject.
            Err(_) => unreachable!(),
        }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn is_ipv4(&self) -> bool {
        self.prefix.addr().is_ipv4()
    }

    /// Whether this is a single-address route (`/32` or `/128`).
    pub fn is_host_route(&self) -> bool {
        match self.prefix.addr() {
            IpAddr::V4(_) => self.prefix.len() == 32,
            IpAddr::V6(_) => self.prefix.len() == 128,
        }
    }

    pub fn in_local_cluster(&self) -> bool {
        self.cluster_id == LOCAL_CLUSTER
    }
}

impl std::fmt::Display for PrefixCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.cluster_id == LOCAL_CLUSTER {
            write!(f, "{}", self.prefix)
        } else {
            write!(f, "{}@{}", self.prefix, self.cluster_id)
        }
    }
}

/// Returns the canonical form of a prefix: IPv4-mapped IPv6 unmapped to
/// IPv4, host bits zeroed. A prefix that cannot be rebuilt is passed
/// through unchanged.
fn canonical(prefix: Prefix) -> Prefix {
    let (addr, len) = match (prefix.addr(), prefix.len()) {
        (IpAddr::V6(v6), len) if len >= 96 => match v6.to_ipv4_mapped() {
            Some(v4) => (IpAddr::V4(v4), len - 96),
            None => (IpAddr::V6(v6), len),
        },
        (addr, len) => (addr, len),
    };
    let masked = match addr {
        IpAddr::V4(v4) => IpAddr::V4(
            u32::from(v4).truncate_to_len(len).into(),
        ),
        IpAddr::V6(v6) => IpAddr::V6(
            u128::from(v6).truncate_to_len(len).into(),
        ),
    };
    match Prefix::new(masked, len) {
        Ok(canonical) => canonical,
        Err(_) => prefix,
    }
}
