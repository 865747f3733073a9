//! Cluster membership: node identities, roles, and the node table.
//!
//! A [`Configuration`] is replicated state.  It is only ever replaced by
//! applying a membership entry from the log; the validation helpers here
//! compute the *next* configuration without mutating the current one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::DbError;

/// Unique, non-zero node identifier.
pub type NodeId = u64;

/// Membership role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Replicates the log but does not count towards quorum.
    Standby,
    /// Replicates the log and votes.
    Voter,
    /// Passive member: no replication, no vote.
    Spare,
}

impl Role {
    /// Wire code used by the control protocol.
    pub fn code(self) -> u8 {
        match self {
            Role::Standby => 0,
            Role::Voter => 1,
            Role::Spare => 2,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Role::Standby),
            1 => Some(Role::Voter),
            2 => Some(Role::Spare),
            _ => None,
        }
    }

    /// Parse a role name (`voter`, `standby`, `spare`) or numeric code.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "voter" => Some(Role::Voter),
            "standby" => Some(Role::Standby),
            "spare" => Some(Role::Spare),
            other => other.parse::<u8>().ok().and_then(Role::from_code),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Standby => "standby",
            Role::Voter => "voter",
            Role::Spare => "spare",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(u8),
            Name(String),
        }
        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Code(code) => Role::from_code(code),
            Raw::Name(name) => Role::parse(&name),
        };
        parsed.ok_or_else(|| serde::de::Error::custom("invalid role"))
    }
}

/// A member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub role: Role,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            address: address.into(),
            role,
        }
    }
}

/// A requested membership change, recorded alongside the resulting
/// configuration in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MembershipChange {
    Bootstrap,
    Add { id: NodeId, address: String },
    Assign { id: NodeId, role: Role },
    Remove { id: NodeId },
}

impl fmt::Display for MembershipChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipChange::Bootstrap => write!(f, "bootstrap"),
            MembershipChange::Add { id, address } => write!(f, "add {id} ({address})"),
            MembershipChange::Assign { id, role } => write!(f, "assign {id} -> {role}"),
            MembershipChange::Remove { id } => write!(f, "remove {id}"),
        }
    }
}

/// The node table.
///
/// Serialized as a plain list of [`NodeInfo`]: numeric map keys do not
/// survive the buffering serde does for internally tagged enums such as
/// log payloads and peer messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    nodes: BTreeMap<NodeId, NodeInfo>,
}

impl Serialize for Configuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.nodes.values())
    }
}

impl<'de> Deserialize<'de> for Configuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = Vec::<NodeInfo>::deserialize(deserializer)?;
        let mut nodes = BTreeMap::new();
        for node in list {
            if nodes.insert(node.id, node).is_some() {
                return Err(serde::de::Error::custom("duplicate node id in configuration"));
            }
        }
        Ok(Self { nodes })
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration in which every given node is a voter.
    pub fn with_voters<I, A>(voters: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, A)>,
        A: Into<String>,
    {
        let nodes = voters
            .into_iter()
            .map(|(id, address)| (id, NodeInfo::new(id, address, Role::Voter)))
            .collect();
        Self { nodes }
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn to_vec(&self) -> Vec<NodeInfo> {
        self.nodes.values().cloned().collect()
    }

    pub fn role_of(&self, id: NodeId) -> Option<Role> {
        self.nodes.get(&id).map(|n| n.role)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.role_of(id) == Some(Role::Voter)
    }

    pub fn voter_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .values()
            .filter(|n| n.role == Role::Voter)
            .map(|n| n.id)
    }

    pub fn voter_count(&self) -> usize {
        self.voter_ids().count()
    }

    /// Whether `acks` contains a strict majority of this configuration's
    /// voters.  A configuration without voters never has a quorum.
    pub fn has_quorum<F>(&self, acks: F) -> bool
    where
        F: Fn(NodeId) -> bool,
    {
        let voters = self.voter_count();
        if voters == 0 {
            return false;
        }
        let granted = self.voter_ids().filter(|id| acks(*id)).count();
        granted > voters / 2
    }

    /// Compute the configuration that results from applying `change`.
    pub fn apply_change(&self, change: &MembershipChange) -> Result<Configuration, DbError> {
        match change {
            MembershipChange::Bootstrap => Ok(self.clone()),
            MembershipChange::Add { id, address } => self.with_added(*id, address),
            MembershipChange::Assign { id, role } => self.with_role(*id, *role),
            MembershipChange::Remove { id } => self.without(*id),
        }
    }

    /// Add a node as a spare.
    pub fn with_added(&self, id: NodeId, address: &str) -> Result<Configuration, DbError> {
        if id == 0 {
            return Err(DbError::Protocol {
                message: "node id must be non-zero".to_string(),
            });
        }
        if self.nodes.contains_key(&id) {
            return Err(DbError::Duplicate {
                message: format!("a node with id {id} is already a member"),
            });
        }
        if self.nodes.values().any(|n| n.address == address) {
            return Err(DbError::Duplicate {
                message: format!("a node with address {address} is already a member"),
            });
        }
        let mut next = self.clone();
        next.nodes
            .insert(id, NodeInfo::new(id, address, Role::Spare));
        Ok(next)
    }

    /// Change the role of an existing node.
    pub fn with_role(&self, id: NodeId, role: Role) -> Result<Configuration, DbError> {
        let current = self
            .nodes
            .get(&id)
            .ok_or(DbError::UnknownMember { id })?;
        if current.role == Role::Voter && role != Role::Voter && self.voter_count() == 1 {
            return Err(DbError::LastVoter);
        }
        let mut next = self.clone();
        if let Some(node) = next.nodes.get_mut(&id) {
            node.role = role;
        }
        Ok(next)
    }

    /// Remove a node.
    pub fn without(&self, id: NodeId) -> Result<Configuration, DbError> {
        let current = self
            .nodes
            .get(&id)
            .ok_or(DbError::UnknownMember { id })?;
        if current.role == Role::Voter && self.voter_count() == 1 {
            return Err(DbError::LastVoter);
        }
        let mut next = self.clone();
        next.nodes.remove(&id);
        Ok(next)
    }
}
