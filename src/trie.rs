//! Longest-prefix-match tries over the stored prefixes.
//!
//! One binary trie per address family, grouped per cluster ID. The tries
//! only index which prefixes exist; all values live in the metadata map.
//! Callers serialize access through the store mutex, so the tries carry no
//! concurrency of their own.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::IpAddr;

use inetnum::addr::Prefix;

use crate::types::af::{IPv4, IPv6};
use crate::types::prefix_cluster::{ClusterId, PrefixCluster};
use crate::types::AddressFamily;

//------------ PrefixTrie ----------------------------------------------------

#[derive(Debug, Default)]
struct Node {
    present: bool,
    children: [Option<Box<Node>>; 2],
}

impl Node {
    fn is_dead(&self) -> bool {
        !self.present
            && self.children[0].is_none()
            && self.children[1].is_none()
    }
}

/// A single-family binary trie. Each stored prefix marks the node at the
/// depth of its length; the path to a node spells out the prefix bits.
#[derive(Debug)]
pub(crate) struct PrefixTrie<AF: AddressFamily> {
    root: Node,
    count: usize,
    _af: PhantomData<AF>,
}

impl<AF: AddressFamily> Default for PrefixTrie<AF> {
    fn default() -> Self {
        PrefixTrie {
            root: Node::default(),
            count: 0,
            _af: PhantomData,
        }
    }
}

impl<AF: AddressFamily> PrefixTrie<AF> {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Marks a prefix as stored. Idempotent. Returns whether the prefix
    /// was newly inserted.
    pub fn upsert(&mut self, bits: AF, len: u8) -> bool {
        let mut node = &mut self.root;
        for depth in 0..len {
            let branch = bits.bit(depth) as usize;
            node = node.children[branch].get_or_insert_with(Box::default);
        }
        if node.present {
            return false;
        }
        node.present = true;
        self.count += 1;
        true
    }

    /// Unmarks a prefix, pruning nodes that no longer lead anywhere.
    /// Idempotent. Returns whether the prefix was present.
    pub fn remove(&mut self, bits: AF, len: u8) -> bool {
        let removed = Self::remove_rec(&mut self.root, bits, len, 0);
        if removed {
            self.count -= 1;
        }
        removed
    }

    fn remove_rec(node: &mut Node, bits: AF, len: u8, depth: u8) -> bool {
        if depth == len {
            let was_present = node.present;
            node.present = false;
            return was_present;
        }
        let branch = bits.bit(depth) as usize;
        let Some(child) = node.children[branch].as_deref_mut() else {
            return false;
        };
        let removed = Self::remove_rec(child, bits, len, depth + 1);
        if child.is_dead() {
            node.children[branch] = None;
        }
        removed
    }

    pub fn contains(&self, bits: AF, len: u8) -> bool {
        let mut node = &self.root;
        for depth in 0..len {
            match node.children[bits.bit(depth) as usize].as_deref() {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.present
    }

    /// Visits all stored prefixes strictly contained in the given prefix.
    /// A host route has no strictly-contained prefixes, so there the
    /// prefix itself is visited when stored. The visitor may return
    /// `false` to stop the enumeration.
    pub fn descendants<F: FnMut(AF, u8) -> bool>(
        &self,
        bits: AF,
        len: u8,
        visit: &mut F,
    ) {
        let mut node = &self.root;
        for depth in 0..len {
            match node.children[bits.bit(depth) as usize].as_deref() {
                Some(child) => node = child,
                None => return,
            }
        }
        let include_self = len == AF::BITS;
        Self::walk(node, bits, len, len, include_self, visit);
    }

    fn walk<F: FnMut(AF, u8) -> bool>(
        node: &Node,
        bits: AF,
        depth: u8,
        parent_len: u8,
        include_self: bool,
        visit: &mut F,
    ) -> bool {
        if node.present
            && (depth > parent_len || (include_self && depth == parent_len))
            && !visit(bits, depth)
        {
            return false;
        }
        if depth >= AF::BITS {
            return true;
        }
        for branch in 0..2 {
            if let Some(child) = node.children[branch].as_deref() {
                let child_bits = if branch == 1 {
                    bits.set_bit(depth)
                } else {
                    bits
                };
                if !Self::walk(
                    child,
                    child_bits,
                    depth + 1,
                    parent_len,
                    include_self,
                    visit,
                ) {
                    return false;
                }
            }
        }
        true
    }

    /// Visits all stored prefixes strictly containing the given prefix,
    /// from longest to shortest. The visitor may return `false` to stop.
    pub fn ancestors<F: FnMut(AF, u8) -> bool>(
        &self,
        bits: AF,
        len: u8,
        visit: &mut F,
    ) {
        let mut on_path: Vec<u8> = Vec::new();
        let mut node = &self.root;
        if node.present && len > 0 {
            on_path.push(0);
        }
        for depth in 0..len {
            match node.children[bits.bit(depth) as usize].as_deref() {
                Some(child) => {
                    node = child;
                    if child.present && depth + 1 < len {
                        on_path.push(depth + 1);
                    }
                }
                None => break,
            }
        }
        for depth in on_path.into_iter().rev() {
            if !visit(bits.truncate_to_len(depth), depth) {
                return;
            }
        }
    }
}

//------------ ClusterTries --------------------------------------------------

#[derive(Debug, Default)]
struct FamilyTries {
    v4: PrefixTrie<IPv4>,
    v6: PrefixTrie<IPv6>,
}

impl FamilyTries {
    fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// The per-cluster LPM tries, dispatching on cluster ID and family.
#[derive(Debug, Default)]
pub(crate) struct ClusterTries {
    clusters: HashMap<ClusterId, FamilyTries>,
}

enum Key {
    V4(IPv4, u8),
    V6(IPv6, u8),
}

fn key(pc: &PrefixCluster) -> Key {
    match pc.prefix().addr() {
        IpAddr::V4(addr) => Key::V4(u32::from(addr), pc.prefix().len()),
        IpAddr::V6(addr) => Key::V6(u128::from(addr), pc.prefix().len()),
    }
}

fn prefix_cluster<AF: AddressFamily>(
    bits: AF,
    len: u8,
    cluster_id: ClusterId,
) -> Option<PrefixCluster> {
    Prefix::new(bits.into_ipaddr(), len)
        .ok()
        .map(|p| PrefixCluster::new(p, cluster_id))
}

impl ClusterTries {
    pub fn upsert(&mut self, pc: &PrefixCluster) -> bool {
        let tries = self.clusters.entry(pc.cluster_id()).or_default();
        match key(pc) {
            Key::V4(bits, len) => tries.v4.upsert(bits, len),
            Key::V6(bits, len) => tries.v6.upsert(bits, len),
        }
    }

    pub fn remove(&mut self, pc: &PrefixCluster) -> bool {
        let Some(tries) = self.clusters.get_mut(&pc.cluster_id()) else {
            return false;
        };
        let removed = match key(pc) {
            Key::V4(bits, len) => tries.v4.remove(bits, len),
            Key::V6(bits, len) => tries.v6.remove(bits, len),
        };
        if tries.is_empty() {
            self.clusters.remove(&pc.cluster_id());
        }
        removed
    }

    pub fn contains(&self, pc: &PrefixCluster) -> bool {
        let Some(tries) = self.clusters.get(&pc.cluster_id()) else {
            return false;
        };
        match key(pc) {
            Key::V4(bits, len) => tries.v4.contains(bits, len),
            Key::V6(bits, len) => tries.v6.contains(bits, len),
        }
    }

    /// All stored prefixes strictly contained in `pc` (or equal to it for
    /// a host route), in no particular order.
    pub fn descendants(&self, pc: &PrefixCluster) -> Vec<PrefixCluster> {
        let Some(tries) = self.clusters.get(&pc.cluster_id()) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        match key(pc) {
            Key::V4(bits, len) => {
                tries.v4.descendants(bits, len, &mut |b, l| {
                    found.extend(prefix_cluster(b, l, pc.cluster_id()));
                    true
                })
            }
            Key::V6(bits, len) => {
                tries.v6.descendants(bits, len, &mut |b, l| {
                    found.extend(prefix_cluster(b, l, pc.cluster_id()));
                    true
                })
            }
        }
        found
    }

    /// All stored prefixes strictly containing `pc`, from longest to
    /// shortest.
    pub fn ancestors(&self, pc: &PrefixCluster) -> Vec<PrefixCluster> {
        let Some(tries) = self.clusters.get(&pc.cluster_id()) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        match key(pc) {
            Key::V4(bits, len) => {
                tries.v4.ancestors(bits, len, &mut |b, l| {
                    found.extend(prefix_cluster(b, l, pc.cluster_id()));
                    true
                })
            }
            Key::V6(bits, len) => {
                tries.v6.ancestors(bits, len, &mut |b, l| {
                    found.extend(prefix_cluster(b, l, pc.cluster_id()));
                    true
                })
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pc(s: &str) -> PrefixCluster {
        PrefixCluster::new(Prefix::from_str(s).unwrap(), 0)
    }

    #[test]
    fn test_upsert_idempotent_and_contains() {
        let mut tries = ClusterTries::default();
        assert!(tries.upsert(&pc("10.0.0.0/8")));
        assert!(!tries.upsert(&pc("10.0.0.0/8")));
        assert!(tries.contains(&pc("10.0.0.0/8")));
        assert!(!tries.contains(&pc("10.0.0.0/9")));
    }

    #[test]
    fn test_descendants_strict() {
        let mut tries = ClusterTries::default();
        for p in ["10.0.0.0/8", "10.1.0.0/16", "10.1.1.0/24", "10.1.1.1/32"]
        {
            tries.upsert(&pc(p));
        }
        tries.upsert(&pc("11.0.0.0/8"));

        let mut ds = tries.descendants(&pc("10.0.0.0/8"));
        ds.sort();
        assert_eq!(
            ds,
            vec![pc("10.1.0.0/16"), pc("10.1.1.0/24"), pc("10.1.1.1/32")]
        );

        // A host route enumerates itself.
        assert_eq!(
            tries.descendants(&pc("10.1.1.1/32")),
            vec![pc("10.1.1.1/32")]
        );

        // A parent that is not itself stored still has descendants.
        let mut ds = tries.descendants(&pc("10.1.0.0/12"));
        ds.sort();
        assert_eq!(
            ds,
            vec![pc("10.1.0.0/16"), pc("10.1.1.0/24"), pc("10.1.1.1/32")]
        );
    }

    #[test]
    fn test_ancestors_longest_first() {
        let mut tries = ClusterTries::default();
        for p in ["0.0.0.0/0", "10.0.0.0/8", "10.1.0.0/16", "10.1.1.0/24"] {
            tries.upsert(&pc(p));
        }
        assert_eq!(
            tries.ancestors(&pc("10.1.1.1/32")),
            vec![
                pc("10.1.1.0/24"),
                pc("10.1.0.0/16"),
                pc("10.0.0.0/8"),
                pc("0.0.0.0/0")
            ]
        );
        // The prefix itself is not its own ancestor.
        assert_eq!(
            tries.ancestors(&pc("10.1.1.0/24")),
            vec![pc("10.1.0.0/16"), pc("10.0.0.0/8"), pc("0.0.0.0/0")]
        );
    }

    #[test]
    fn test_remove_prunes() {
        let mut tries = ClusterTries::default();
        tries.upsert(&pc("10.0.0.0/8"));
        tries.upsert(&pc("10.1.0.0/16"));
        assert!(tries.remove(&pc("10.1.0.0/16")));
        assert!(!tries.remove(&pc("10.1.0.0/16")));
        assert!(tries.contains(&pc("10.0.0.0/8")));
        assert!(tries.remove(&pc("10.0.0.0/8")));
        assert!(tries.clusters.is_empty());
    }

    #[test]
    fn test_clusters_are_disjoint() {
        let mut tries = ClusterTries::default();
        let local = pc("10.0.0.0/8");
        let remote =
            PrefixCluster::new(Prefix::from_str("10.0.0.0/8").unwrap(), 3);
        tries.upsert(&local);
        assert!(!tries.contains(&remote));
        tries.upsert(&remote);
        let child =
            PrefixCluster::new(Prefix::from_str("10.1.0.0/16").unwrap(), 3);
        tries.upsert(&child);
        assert_eq!(tries.descendants(&local), vec![]);
        assert_eq!(tries.descendants(&remote), vec![child]);
    }

    #[test]
    fn test_ipv6_descendants() {
        let mut tries = ClusterTries::default();
        tries.upsert(&pc("2001:db8::/32"));
        tries.upsert(&pc("2001:db8:1::/48"));
        assert_eq!(
            tries.descendants(&pc("2001:db8::/32")),
            vec![pc("2001:db8:1::/48")]
        );
        assert_eq!(
            tries.ancestors(&pc("2001:db8:1::/48")),
            vec![pc("2001:db8::/32")]
        );
    }
}
