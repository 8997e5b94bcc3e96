//! VM tag codec.
//!
//! Tags are the only record of which allocation a VM belongs to. They live
//! in the VM's `tags` metadata field as `key.value` pairs joined with `;`,
//! for example `node.h1;vm.h1-b178-s00;role.target;allocation.b178`.
//!
//! There is no escaping: a `.` or `;` inside a key or value cannot be
//! represented. [`TagSet::validate`] rejects such sets before they are
//! written, and [`TagSet::decode`] drops entries it cannot split cleanly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const ENTRY_SEPARATOR: char = ';';
const KEY_SEPARATOR: char = '.';

/// A tag key. Recognised keys come first, in the order they are encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagKey {
    /// Hypervisor node the VM was created on
    Node,
    /// Full VM name (`<node>-<allocation>-<machine>`)
    Vm,
    /// Role inside the allocation
    Role,
    /// Short random allocation id shared by every member
    Allocation,
    /// Cluster name
    ClusterName,
    /// Cluster id stamped when the allocation is assigned to a cluster
    ClusterId,
    /// Software version installed on the allocation
    Version,
    /// Any key not known to this crate, kept verbatim
    Other(String),
}

impl TagKey {
    /// The short key as written in the tag string.
    pub fn as_str(&self) -> &str {
        match self {
            TagKey::Node => "node",
            TagKey::Vm => "vm",
            TagKey::Role => "role",
            TagKey::Allocation => "allocation",
            TagKey::ClusterName => "cname",
            TagKey::ClusterId => "cid",
            TagKey::Version => "ver",
            TagKey::Other(key) => key,
        }
    }

    /// Map a short key to its typed form. Never fails; unknown keys become
    /// [`TagKey::Other`].
    pub fn parse(key: &str) -> Self {
        match key {
            "node" => TagKey::Node,
            "vm" => TagKey::Vm,
            "role" => TagKey::Role,
            "allocation" => TagKey::Allocation,
            "cname" => TagKey::ClusterName,
            "cid" => TagKey::ClusterId,
            "ver" => TagKey::Version,
            other => TagKey::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a VM inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Storage target server
    Target,
    /// Client that connects to the targets
    Initiator,
}

impl Role {
    /// The role as written in tags and descriptors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Target => "target",
            Role::Initiator => "initiator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "target" => Ok(Role::Target),
            "initiator" => Ok(Role::Initiator),
            other => Err(Error::InvalidTag {
                message: format!("unknown role '{other}' (expected target or initiator)"),
            }),
        }
    }
}

/// Typed tag mapping stored on a VM.
///
/// Keys are unique. Equality is map equality; the encoded form always lists
/// keys in [`TagKey`] order so equal sets encode to equal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: BTreeMap<TagKey, String>,
}

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the legacy `key.value;key.value` form.
    ///
    /// Entries that do not split on `.` into exactly two parts are dropped.
    pub fn decode(raw: &str) -> Self {
        let mut set = Self::new();
        for entry in raw.split(ENTRY_SEPARATOR) {
            let mut parts = entry.split(KEY_SEPARATOR);
            if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
                set.tags.insert(TagKey::parse(key), value.to_string());
            }
        }
        set
    }

    /// Serialize to the legacy `key.value;key.value` form.
    pub fn encode(&self) -> String {
        self.tags
            .iter()
            .map(|(key, value)| format!("{key}{KEY_SEPARATOR}{value}"))
            .collect::<Vec<_>>()
            .join(&ENTRY_SEPARATOR.to_string())
    }

    /// Check that every key and value survives an encode/decode round trip.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.tags {
            let key = key.as_str();
            if key.is_empty() {
                return Err(Error::InvalidTag {
                    message: "empty tag key".to_string(),
                });
            }
            for text in [key, value.as_str()] {
                if text.contains(KEY_SEPARATOR) || text.contains(ENTRY_SEPARATOR) {
                    return Err(Error::InvalidTag {
                        message: format!("'{key}.{value}' contains '.' or ';'"),
                    });
                }
            }
        }
        Ok(())
    }

    /// True iff every tag in `self` has an identical value in `other`.
    ///
    /// An empty set is a subset of everything, which is how "match all" tag
    /// queries work.
    pub fn is_subset(&self, other: &TagSet) -> bool {
        self.tags
            .iter()
            .all(|(key, value)| other.tags.get(key) == Some(value))
    }

    /// Whether the set has no tags.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Get a tag value.
    pub fn get(&self, key: &TagKey) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Set a tag, replacing any existing value.
    pub fn set(&mut self, key: TagKey, value: impl Into<String>) -> &mut Self {
        self.tags.insert(key, value.into());
        self
    }

    /// Add every tag of `other` that is not already present.
    pub fn merge_missing(&mut self, other: &TagSet) {
        for (key, value) in &other.tags {
            self.tags
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Iterate over tags in encoding order.
    pub fn iter(&self) -> impl Iterator<Item = (&TagKey, &str)> {
        self.tags.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Builder: set an arbitrary tag.
    pub fn with(mut self, key: TagKey, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Builder: set the node tag.
    pub fn with_node(self, node: impl Into<String>) -> Self {
        self.with(TagKey::Node, node)
    }

    /// Builder: set the VM name tag.
    pub fn with_vm_name(self, name: impl Into<String>) -> Self {
        self.with(TagKey::Vm, name)
    }

    /// Builder: set the role tag.
    pub fn with_role(self, role: Role) -> Self {
        self.with(TagKey::Role, role.as_str())
    }

    /// Builder: set the allocation tag.
    pub fn with_allocation(self, allocation: impl Into<String>) -> Self {
        self.with(TagKey::Allocation, allocation)
    }

    /// Builder: set the cluster id tag.
    pub fn with_cluster_id(self, cluster_id: impl Into<String>) -> Self {
        self.with(TagKey::ClusterId, cluster_id)
    }

    /// Builder: set the version tag.
    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.with(TagKey::Version, version)
    }

    /// The node tag.
    pub fn node(&self) -> Option<&str> {
        self.get(&TagKey::Node)
    }

    /// The VM name tag.
    pub fn vm_name(&self) -> Option<&str> {
        self.get(&TagKey::Vm)
    }

    /// The allocation id tag.
    pub fn allocation(&self) -> Option<&str> {
        self.get(&TagKey::Allocation)
    }

    /// The cluster id tag.
    pub fn cluster_id(&self) -> Option<&str> {
        self.get(&TagKey::ClusterId)
    }

    /// The version tag.
    pub fn version(&self) -> Option<&str> {
        self.get(&TagKey::Version)
    }

    /// The role tag, if present and one of the known roles.
    pub fn role(&self) -> Option<Role> {
        self.get(&TagKey::Role).and_then(|r| r.parse().ok())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for TagSet {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::decode(s))
    }
}

impl Serialize for TagSet {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::decode(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_allocation_member() {
        let tags = TagSet::new()
            .with_allocation("b178")
            .with_role(Role::Target)
            .with_vm_name("h1-b178-s00")
            .with_node("h1");
        assert_eq!(tags.encode(), "node.h1;vm.h1-b178-s00;role.target;allocation.b178");
    }

    #[test]
    fn test_decode_known_and_unknown_keys() {
        let tags = TagSet::decode("node.h1;role.initiator;owner.dana");
        assert_eq!(tags.node(), Some("h1"));
        assert_eq!(tags.role(), Some(Role::Initiator));
        assert_eq!(tags.get(&TagKey::Other("owner".into())), Some("dana"));
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_decode_drops_malformed_entries() {
        let tags = TagSet::decode("node.h1;garbage;ver.3.10.1;;cid.");
        assert_eq!(tags.node(), Some("h1"));
        // more than one '.' cannot be split into exactly two parts
        assert_eq!(tags.version(), None);
        // an empty value still splits into two parts
        assert_eq!(tags.cluster_id(), Some(""));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_decode_empty() {
        assert!(TagSet::decode("").is_empty());
    }

    #[test]
    fn test_unknown_role_is_absent() {
        let tags = TagSet::decode("role.observer");
        assert_eq!(tags.role(), None);
        assert_eq!(tags.get(&TagKey::Role), Some("observer"));
    }

    #[test]
    fn test_is_subset() {
        let vm = TagSet::decode("node.h1;role.target;allocation.b178");
        let query = TagSet::new().with_allocation("b178");
        assert!(query.is_subset(&vm));
        assert!(!query.clone().with_role(Role::Initiator).is_subset(&vm));
        assert!(!TagSet::new().with_allocation("c001").is_subset(&vm));
        assert!(TagSet::new().is_subset(&vm));
        assert!(TagSet::new().is_subset(&TagSet::new()));
    }

    #[test]
    fn test_equality_ignores_encoding_order() {
        let a = TagSet::decode("role.target;node.h1");
        let b = TagSet::decode("node.h1;role.target");
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_rejects_delimiters() {
        assert!(TagSet::new().with_version("3.10.1").validate().is_err());
        assert!(TagSet::new().with_node("a;b").validate().is_err());
        assert!(TagSet::new().with_node("h1").validate().is_ok());
    }

    #[test]
    fn test_merge_missing_keeps_existing() {
        let mut tags = TagSet::new().with_node("h1");
        tags.merge_missing(&TagSet::new().with_node("h2").with_cluster_id("c1"));
        assert_eq!(tags.node(), Some("h1"));
        assert_eq!(tags.cluster_id(), Some("c1"));
    }

    #[test]
    fn test_serde_as_string() {
        let tags = TagSet::new().with_node("h1").with_role(Role::Target);
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, "\"node.h1;role.target\"");
        let back: TagSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tags);
    }

    fn arb_key() -> impl Strategy<Value = TagKey> {
        "[a-z][a-z0-9_-]{0,9}".prop_map(|k| TagKey::parse(&k))
    }

    fn arb_tags() -> impl Strategy<Value = TagSet> {
        prop::collection::btree_map(arb_key(), "[A-Za-z0-9_-]{0,12}", 0..8)
            .prop_map(|tags| TagSet { tags })
    }

    proptest! {
        #[test]
        fn test_decode_inverts_encode(tags in arb_tags()) {
            prop_assert!(tags.validate().is_ok());
            prop_assert_eq!(TagSet::decode(&tags.encode()), tags);
        }

        #[test]
        fn test_subset_matches_definition(a in arb_tags(), b in arb_tags()) {
            let expected = a.iter().all(|(k, v)| b.get(k) == Some(v));
            prop_assert_eq!(a.is_subset(&b), expected);
        }

        #[test]
        fn test_every_subset_of_itself(a in arb_tags()) {
            prop_assert!(a.is_subset(&a));
            prop_assert!(TagSet::new().is_subset(&a));
        }
    }
}
