use std::collections::BTreeMap;

use inetnum::addr::Prefix;
use serde_derive::Serialize;

//------------ Label sources -------------------------------------------------

pub const LABEL_SOURCE_RESERVED: &str = "reserved";
pub const LABEL_SOURCE_CIDR: &str = "cidr";
pub const LABEL_SOURCE_FQDN: &str = "fqdn";
pub const LABEL_SOURCE_CIDRGROUP: &str = "cidrgroup";
pub const LABEL_SOURCE_NODE: &str = "node";

pub const LABEL_HOST: &str = "host";
pub const LABEL_REMOTE_NODE: &str = "remote-node";
pub const LABEL_HEALTH: &str = "health";
pub const LABEL_INGRESS: &str = "ingress";
pub const LABEL_WORLD: &str = "world";
pub const LABEL_WORLD_IPV4: &str = "world-ipv4";
pub const LABEL_WORLD_IPV6: &str = "world-ipv6";
pub const LABEL_KUBE_APISERVER: &str = "kube-apiserver";

//------------ Label ---------------------------------------------------------

/// A single source-tagged label.
///
/// The source here is the label namespace (`reserved`, `cidr`, `k8s`, ...),
/// not the precedence [`Source`](crate::types::source::Source) of the
/// contribution that carried it.
#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Label {
    source: String,
    key: String,
    value: String,
}

impl Label {
    pub fn new(
        source: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Label {
            source: source.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// A `reserved:` label with an empty value.
    pub fn reserved(key: impl Into<String>) -> Self {
        Label::new(LABEL_SOURCE_RESERVED, key, "")
    }

    /// The `cidr:` label for a prefix. Colons in IPv6 prefixes are encoded
    /// as dashes, since downstream label keys cannot carry colons.
    pub fn cidr(prefix: &Prefix) -> Self {
        Label::new(
            LABEL_SOURCE_CIDR,
            prefix.to_string().replace(':', "-"),
            "",
        )
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The unique name of this label, `source:key`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.source, self.key)
    }

    pub fn is_reserved(&self) -> bool {
        self.source == LABEL_SOURCE_RESERVED
    }

    fn is_reserved_key(&self, key: &str) -> bool {
        self.is_reserved() && self.key == key
    }

    pub fn is_world(&self) -> bool {
        self.is_reserved()
            && matches!(
                self.key.as_str(),
                LABEL_WORLD | LABEL_WORLD_IPV4 | LABEL_WORLD_IPV6
            )
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.source, self.key)
        } else {
            write!(f, "{}:{}={}", self.source, self.key, self.value)
        }
    }
}

//------------ LabelSet ------------------------------------------------------

/// A set of labels, keyed by label name.
///
/// Backed by a `BTreeMap` so iteration order, and with it every merge
/// outcome, is deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LabelSet {
    labels: BTreeMap<String, Label>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Inserts a label, replacing any label with the same name. Returns
    /// whether the set changed.
    pub fn insert(&mut self, label: Label) -> bool {
        match self.labels.insert(label.name(), label.clone()) {
            Some(old) => old != label,
            None => true,
        }
    }

    /// Inserts a label only if no label with the same name is present.
    /// Returns whether the set changed.
    pub fn insert_if_absent(&mut self, label: Label) -> bool {
        let name = label.name();
        if self.labels.contains_key(&name) {
            return false;
        }
        self.labels.insert(name, label);
        true
    }

    /// Removes the label with the same name, regardless of its value.
    /// Returns whether the set changed.
    pub fn remove(&mut self, label: &Label) -> bool {
        self.labels.remove(&label.name()).is_some()
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.labels.get(&label.name()) == Some(label)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Label> {
        self.labels.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }

    /// Fills in all labels from `other` whose names are absent here.
    /// Returns whether the set changed.
    pub fn merge_missing(&mut self, other: &LabelSet) -> bool {
        let mut changed = false;
        for label in other.iter() {
            changed |= self.insert_if_absent(label.clone());
        }
        changed
    }

    /// Removes all labels whose names appear in `other`. Returns whether
    /// the set changed.
    pub fn subtract(&mut self, other: &LabelSet) -> bool {
        let mut changed = false;
        for label in other.iter() {
            changed |= self.remove(label);
        }
        changed
    }

    /// Whether every label in `subset` is present here with an equal value.
    pub fn is_superset_of(&self, subset: &LabelSet) -> bool {
        subset.iter().all(|l| self.contains(l))
    }

    pub fn has_label_source(&self, source: &str) -> bool {
        self.iter().any(|l| l.source() == source)
    }

    /// Drops every label with the given label source. Returns whether the
    /// set changed.
    pub fn remove_label_source(&mut self, source: &str) -> bool {
        let before = self.labels.len();
        self.labels.retain(|_, l| l.source() != source);
        before != self.labels.len()
    }

    pub fn has_reserved(&self, key: &str) -> bool {
        self.iter().any(|l| l.is_reserved_key(key))
    }

    /// Drops every `reserved:world*` variant. Returns whether the set
    /// changed.
    pub fn remove_world(&mut self) -> bool {
        let before = self.labels.len();
        self.labels.retain(|_, l| !l.is_world());
        before != self.labels.len()
    }

    pub fn has_world(&self) -> bool {
        self.iter().any(|l| l.is_world())
    }
}

impl FromIterator<Label> for LabelSet {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        let mut set = LabelSet::new();
        for label in iter {
            set.insert(label);
        }
        set
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        write!(f, "[")?;
        for label in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", label)?;
            first = false;
        }
        write!(f, "]")
    }
}
