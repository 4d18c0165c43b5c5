use serde_derive::Serialize;

//------------ Source --------------------------------------------------------

/// The origin of a metadata contribution, ordered by precedence.
///
/// When two contributors disagree on an attribute for the same prefix, the
/// attribute from the higher-precedence source wins. Variants are declared
/// from lowest to highest precedence, so the derived `Ord` is the precedence
/// order.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum Source {
    /// No source specified. Loses every precedence battle.
    #[default]
    Unspec,
    /// Derived by the agent itself, e.g. restored from a previous run.
    Generated,
    /// Synchronized from the key-value store.
    KVStore,
    /// A custom resource watched from the Kubernetes API.
    CustomResource,
    /// Determined by the local agent, e.g. the host itself.
    Local,
    /// The kube-apiserver reachability watcher. Highest precedence.
    KubeAPIServer,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Source::Unspec => write!(f, "unspec"),
            Source::Generated => write!(f, "generated"),
            Source::KVStore => write!(f, "kvstore"),
            Source::CustomResource => write!(f, "custom-resource"),
            Source::Local => write!(f, "local"),
            Source::KubeAPIServer => write!(f, "kube-apiserver"),
        }
    }
}
