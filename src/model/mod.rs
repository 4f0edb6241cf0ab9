//! Resource model for declared stacks.
//!
//! This module holds the immutable description of what should exist:
//! - Resource nodes with typed, possibly unresolved properties
//! - Stacks grouping nodes, explicit edges and named outputs

mod resource;
mod stack;

pub use resource::{
    CUSTOM_RESOURCE_KIND, DEFAULT_ATTRIBUTE, OutputRef, PropertyValue, Reference, RemovalPolicy,
    ResolvedProperties, ResourceNode, ValueSource, resolve_properties,
};
pub use stack::Stack;
