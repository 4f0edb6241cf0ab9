//! State management for applied stacks.
//!
//! This module persists the last-applied record of every stack (resolved
//! properties, outputs, dependencies), the deployment history, and the
//! deployment lock that serializes concurrent sessions.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    AppliedResource, DeploymentHistoryEntry, DeploymentOperation, DeploymentState,
    RecordedDependency, STATE_VERSION, StackState, decode_state, encode_state,
};
