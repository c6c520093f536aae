use serde::{Deserialize, Serialize};

/// Node identifier. 1-based; 0 is the null node. Assigned at startup from
/// the ordered host list.
pub type NodeId = u32;

/// The shared shape of state, queue and task identifiers.
///
/// `node` is the home node of the identified object, `hash` deterministically
/// partitions work across lanes, `unique` distinguishes objects created on
/// the same node.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    pub node: NodeId,
    pub hash: u32,
    pub unique: u64,
}

impl UniqueId {
    #[must_use]
    pub fn new(node: NodeId, unique: u64) -> Self {
        Self {
            node,
            hash: 0,
            unique,
        }
    }

    #[must_use]
    pub fn with_hash(node: NodeId, hash: u32, unique: u64) -> Self {
        Self { node, hash, unique }
    }

    #[must_use]
    pub fn null() -> Self {
        Self::new(0, 0)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.node == 0
    }
}

impl core::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.node, self.unique)
    }
}

macro_rules! unique_id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[repr(C)]
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub UniqueId);

        impl $name {
            #[must_use]
            pub fn new(node: NodeId, unique: u64) -> Self {
                Self(UniqueId::new(node, unique))
            }

            #[must_use]
            pub fn with_hash(node: NodeId, hash: u32, unique: u64) -> Self {
                Self(UniqueId::with_hash(node, hash, unique))
            }

            #[must_use]
            pub fn null() -> Self {
                Self(UniqueId::null())
            }

            #[must_use]
            pub fn is_null(&self) -> bool {
                self.0.is_null()
            }

            #[must_use]
            pub fn node(&self) -> NodeId {
                self.0.node
            }

            #[must_use]
            pub fn unique(&self) -> u64 {
                self.0.unique
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

unique_id_type!(
    /// Uniquely identifies a task state.
    TaskStateId
);
unique_id_type!(
    /// Uniquely identifies a queue. Derived from the owning task state's id
    /// so lookup is O(1).
    QueueId
);
unique_id_type!(
    /// Uniquely identifies an individual task.
    TaskId
);

impl From<TaskStateId> for QueueId {
    fn from(id: TaskStateId) -> Self {
        QueueId(id.0)
    }
}

impl From<QueueId> for TaskStateId {
    fn from(id: QueueId) -> Self {
        TaskStateId(id.0)
    }
}

/// Routing target of a task.
pub mod domain_flags {
    /// Include the local node in the scheduling decision.
    pub const LOCAL: u32 = 1 << 0;
    /// Use all nodes.
    pub const GLOBAL: u32 = 1 << 1;
    /// The id names a node set, not a single node.
    pub const SET: u32 = 1 << 2;
    /// The id names a specific node.
    pub const NODE: u32 = 1 << 3;
}

/// Where a task should run: the local node, a specific node, a node set, or
/// every node — optionally also including the local node.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId {
    pub flags: u32,
    pub id: u32,
}

impl DomainId {
    #[must_use]
    pub fn local() -> Self {
        Self {
            flags: domain_flags::LOCAL,
            id: 0,
        }
    }

    #[must_use]
    pub fn node(node: NodeId) -> Self {
        Self {
            flags: domain_flags::NODE,
            id: node,
        }
    }

    #[must_use]
    pub fn node_with_local(node: NodeId) -> Self {
        Self {
            flags: domain_flags::NODE | domain_flags::LOCAL,
            id: node,
        }
    }

    #[must_use]
    pub fn global() -> Self {
        Self {
            flags: domain_flags::GLOBAL,
            id: 0,
        }
    }

    #[must_use]
    pub fn set(set_id: u32) -> Self {
        Self {
            flags: domain_flags::SET,
            id: set_id,
        }
    }

    #[must_use]
    pub fn set_with_local(set_id: u32) -> Self {
        Self {
            flags: domain_flags::SET | domain_flags::LOCAL,
            id: set_id,
        }
    }

    #[must_use]
    pub fn is_node(&self) -> bool {
        self.flags & domain_flags::NODE != 0
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.flags & domain_flags::GLOBAL != 0
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flags & domain_flags::SET != 0
    }

    #[must_use]
    pub fn includes_local(&self) -> bool {
        self.flags & domain_flags::LOCAL != 0
    }

    /// Whether dispatching this domain leaves the current node. On a
    /// single-host cluster nothing is ever remote.
    #[must_use]
    pub fn is_remote(&self, num_hosts: usize, this_node: NodeId) -> bool {
        if num_hosts == 1 {
            return false;
        }
        if self.flags & (domain_flags::GLOBAL | domain_flags::SET) != 0 {
            return true;
        }
        self.is_node() && self.id != this_node
    }
}

impl core::fmt::Display for DomainId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_global() {
            write!(f, "global")
        } else if self.is_set() {
            write!(f, "set({})", self.id)
        } else if self.is_node() {
            write!(f, "node({})", self.id)
        } else {
            write!(f, "local")
        }
    }
}

/// A task's position within a task graph. Depth 0 is the root; sub-tasks
/// spawned inside a `run` carry the parent's root with `depth + 1`.
///
/// Immutable for the task's lifetime; replicas produced by remote dispatch
/// carry the parent's node unchanged.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskNode {
    pub root: TaskId,
    pub depth: u32,
}

impl TaskNode {
    #[must_use]
    pub fn root(root: TaskId) -> Self {
        Self { root, depth: 0 }
    }

    #[must_use]
    pub fn null() -> Self {
        Self {
            root: TaskId::null(),
            depth: 0,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.root.is_null()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// The node of a sub-task spawned `levels` below this one.
    #[must_use]
    pub fn child(&self, levels: u32) -> Self {
        Self {
            root: self.root,
            depth: self.depth + levels,
        }
    }
}

impl core::fmt::Display for TaskNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.root, self.depth)
    }
}

#[cfg(test)]
mod test_ids {
    use super::*;

    #[test]
    fn queue_id_tracks_state_id() {
        let state = TaskStateId::with_hash(2, 7, 42);
        let queue = QueueId::from(state);
        assert_eq!(queue.node(), 2);
        assert_eq!(queue.unique(), 42);
        assert_eq!(queue.0.hash, 7);
    }

    #[test]
    fn null_ids() {
        assert!(TaskStateId::null().is_null());
        assert!(!TaskId::new(1, 0).is_null());
        assert!(TaskNode::null().is_null());
    }

    #[test]
    fn domain_remote_resolution() {
        // Single host: never remote.
        assert!(!DomainId::global().is_remote(1, 1));
        assert!(!DomainId::node(9).is_remote(1, 1));

        // Multi host.
        assert!(DomainId::global().is_remote(4, 1));
        assert!(DomainId::set(3).is_remote(4, 1));
        assert!(DomainId::node(2).is_remote(4, 1));
        assert!(!DomainId::node(1).is_remote(4, 1));
        assert!(!DomainId::local().is_remote(4, 1));
    }

    #[test]
    fn task_node_children_share_root() {
        let root = TaskNode::root(TaskId::new(1, 10));
        let child = root.child(1);
        assert_eq!(child.root, root.root);
        assert_eq!(child.depth, 1);
        assert!(!child.is_root());
        assert_eq!(child.child(2).depth, 3);
    }
}
