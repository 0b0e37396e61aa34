use crate::capability::{Capability, SdkVersion, ThreadRole};
use crate::handle_table::Handle;
use thiserror::Error;

/// A batch could not be replayed against the receiving tree.
///
/// Operations before `index` in the batch stay applied. The receiving side is
/// desynchronized from the sender and should ask for a resync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol error in batch rev={rev:?} at op #{index}: {reason}")]
pub struct ProtocolError {
    pub rev: Option<u64>,
    pub index: usize,
    pub reason: String,
}

impl ProtocolError {
    pub fn new(rev: Option<u64>, index: usize, reason: impl Into<String>) -> Self {
        Self {
            rev,
            index,
            reason: reason.into(),
        }
    }
}

/// A local structural mutation was rejected before anything was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("handle {0} is not bound to a live node")]
    HandleNotFound(Handle),
    #[error("node {child} is not a child of node {parent}")]
    NotAChild { parent: Handle, child: Handle },
    #[error("inserting node {child} under node {parent} would create a cycle")]
    Cycle { parent: Handle, child: Handle },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot kind '{0}' is not registered")]
    UnknownKind(String),
    #[error("snapshot instance {0} does not exist")]
    NotFound(i64),
    #[error("snapshot {child} is not a child of snapshot {parent}")]
    NotAChild { parent: i64, child: i64 },
    #[error("moving snapshot {child} under snapshot {parent} would create a cycle")]
    Cycle { parent: i64, child: i64 },
    #[error("snapshot {0} has no children slot")]
    NoChildrenSlot(i64),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("{capability} requires runtime version {required}, but running on {actual}")]
    Unsupported {
        capability: Capability,
        required: SdkVersion,
        actual: SdkVersion,
    },
    #[error("{capability} can not be used on the {thread} thread")]
    WrongThread {
        capability: Capability,
        thread: ThreadRole,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer endpoint disconnected")]
    Disconnected,
    #[error("too many in-flight calls (limit={limit})")]
    TooManyInFlight { limit: usize },
    #[error("codec error: {0}")]
    Codec(#[from] std::io::Error),
}

/// Failure of a cross-thread call as observed by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The callee raised; the message is all that crosses the boundary.
    #[error("remote invocation failed: {0}")]
    Remote(String),
    /// The endpoint holding the pending entry went away before any reply.
    #[error("call abandoned before the peer replied")]
    Abandoned,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("depth of value exceeds limit of {limit}")]
    DepthLimit { limit: usize },
    /// A poisoned js-function handle was called.
    #[error("{0}")]
    InvalidFunction(String),
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}
