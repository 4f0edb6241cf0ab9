//! Resource nodes and their property values.
//!
//! A property is either a literal or a placeholder that only becomes known
//! once something else has been deployed: a `$ref` to another node of the
//! same stack, or an `$import` of another stack's output.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::hooks::LifecycleHook;

/// Kind tag of nodes allowed to carry a lifecycle hook.
pub const CUSTOM_RESOURCE_KIND: &str = "custom-resource";

/// Attribute used when a `$ref` names only a node.
pub const DEFAULT_ATTRIBUTE: &str = "id";

/// Fully resolved properties or outputs of a node.
pub type ResolvedProperties = BTreeMap<String, Value>;

/// What happens to a resource when it leaves the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Delete the resource.
    #[default]
    Destroy,
    /// Never delete; forget it from state.
    Retain,
    /// Delete only after its cleanup hook succeeded in the same run.
    RetainUntilExplicitDelete,
}

impl fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroy => write!(f, "destroy"),
            Self::Retain => write!(f, "retain"),
            Self::RetainUntilExplicitDelete => write!(f, "retain-until-explicit-delete"),
        }
    }
}

/// Placeholder for an attribute of another node in the same stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced logical id.
    pub node: String,
    /// Attribute of the referenced node's outputs.
    pub attribute: String,
}

impl Reference {
    /// Creates a reference to `node.attribute`.
    #[must_use]
    pub fn new(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            attribute: attribute.into(),
        }
    }

    /// Parses `Node.attr`, or `Node` which refers to its `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node part is empty.
    pub fn parse(raw: &str) -> std::result::Result<Self, ConfigError> {
        let (node, attribute) = raw.split_once('.').unwrap_or((raw, DEFAULT_ATTRIBUTE));
        if node.is_empty() || attribute.is_empty() {
            return Err(ConfigError::invalid_reference(raw, "expected 'Node' or 'Node.attribute'"));
        }
        Ok(Self::new(node, attribute))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.attribute)
    }
}

/// Placeholder for a named output of another stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    /// Owning stack.
    pub stack: String,
    /// Output name.
    pub output: String,
}

impl OutputRef {
    /// Creates a reference to `stack.output`.
    #[must_use]
    pub fn new(stack: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            output: output.into(),
        }
    }

    /// Parses `Stack.output`.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is missing.
    pub fn parse(raw: &str) -> std::result::Result<Self, ConfigError> {
        match raw.split_once('.') {
            Some((stack, output)) if !stack.is_empty() && !output.is_empty() => {
                Ok(Self::new(stack, output))
            }
            _ => Err(ConfigError::invalid_reference(raw, "expected 'Stack.output'")),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stack, self.output)
    }
}

/// Something that knows deployed node attributes and stack outputs.
pub trait ValueSource {
    /// Attribute of a node in the stack being deployed.
    ///
    /// `Ok(None)` means the node has not settled yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the node settled without that attribute.
    fn node_attribute(&self, reference: &Reference) -> Result<Option<Value>>;

    /// Output of another stack.
    ///
    /// `Ok(None)` means the value is unknown and the caller tolerates it.
    ///
    /// # Errors
    ///
    /// Returns an error when the output cannot be provided.
    fn stack_output(&self, output: &OutputRef) -> Result<Option<Value>>;
}

/// A property value as declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum PropertyValue {
    /// A plain JSON value.
    Literal(Value),
    /// `{"$ref": "Node.attr"}`
    Ref(Reference),
    /// `{"$import": "Stack.output"}`
    Import(OutputRef),
    /// A list containing placeholders.
    List(Vec<PropertyValue>),
    /// A map containing placeholders.
    Map(BTreeMap<String, PropertyValue>),
    /// `{"$join": [...]}` string concatenation.
    Join(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Literal string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Literal(Value::String(value.into()))
    }

    /// Reference to `node.attribute`.
    #[must_use]
    pub fn reference(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Ref(Reference::new(node, attribute))
    }

    /// Import of `stack.output`.
    #[must_use]
    pub fn import(stack: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Import(OutputRef::new(stack, output))
    }

    /// Intra-stack references, in first-seen order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.visit(&mut |value| {
            if let Self::Ref(r) = value {
                out.push(r);
            }
        });
        out
    }

    /// Cross-stack imports, in first-seen order.
    #[must_use]
    pub fn imports(&self) -> Vec<&OutputRef> {
        let mut out = Vec::new();
        self.visit(&mut |value| {
            if let Self::Import(o) = value {
                out.push(o);
            }
        });
        out
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        f(self);
        match self {
            Self::List(items) | Self::Join(items) => items.iter().for_each(|i| i.visit(f)),
            Self::Map(map) => map.values().for_each(|v| v.visit(f)),
            Self::Literal(_) | Self::Ref(_) | Self::Import(_) => {}
        }
    }

    /// Resolves every placeholder.
    ///
    /// Returns `Ok(None)` when some placeholder is not known yet.
    ///
    /// # Errors
    ///
    /// Propagates source errors and rejects `$join` parts that are not scalars.
    pub fn resolve(&self, source: &dyn ValueSource) -> Result<Option<Value>> {
        match self {
            Self::Literal(v) => Ok(Some(v.clone())),
            Self::Ref(r) => source.node_attribute(r),
            Self::Import(o) => source.stack_output(o),
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(source)? {
                        Some(v) => out.push(v),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Array(out)))
            }
            Self::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    match item.resolve(source)? {
                        Some(v) => {
                            out.insert(key.clone(), v);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Object(out)))
            }
            Self::Join(parts) => {
                let mut joined = String::new();
                for part in parts {
                    match part.resolve(source)? {
                        Some(Value::String(s)) => joined.push_str(&s),
                        Some(v @ (Value::Number(_) | Value::Bool(_))) => {
                            joined.push_str(&v.to_string());
                        }
                        Some(other) => {
                            return Err(ConfigError::invalid_reference(
                                other.to_string(),
                                "$join parts must resolve to scalars",
                            )
                            .into());
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::String(joined)))
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl TryFrom<Value> for PropertyValue {
    type Error = ConfigError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Object(map) if map.len() == 1 => {
                let Some((key, inner)) = map.iter().next().map(|(k, v)| (k.clone(), v.clone())) else {
                    return Ok(Self::Literal(Value::Object(map)));
                };
                match key.as_str() {
                    "$ref" => match inner.as_str() {
                        Some(raw) => Ok(Self::Ref(Reference::parse(raw)?)),
                        None => Err(ConfigError::invalid_reference(inner.to_string(), "$ref expects a string")),
                    },
                    "$import" => match inner.as_str() {
                        Some(raw) => Ok(Self::Import(OutputRef::parse(raw)?)),
                        None => Err(ConfigError::invalid_reference(
                            inner.to_string(),
                            "$import expects a string",
                        )),
                    },
                    "$join" => match inner {
                        Value::Array(parts) => Ok(Self::Join(
                            parts
                                .into_iter()
                                .map(Self::try_from)
                                .collect::<std::result::Result<_, _>>()?,
                        )),
                        _ => Err(ConfigError::invalid_reference(inner.to_string(), "$join expects a list")),
                    },
                    k if k.starts_with('$') => {
                        Err(ConfigError::invalid_reference(k, "unknown directive"))
                    }
                    _ => Self::from_map(map),
                }
            }
            Value::Object(map) => Self::from_map(map),
            Value::Array(items) => {
                let converted = items
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if converted.iter().all(|v| matches!(v, Self::Literal(_))) {
                    Ok(Self::Literal(Value::Array(converted.into_iter().map(Value::from).collect())))
                } else {
                    Ok(Self::List(converted))
                }
            }
            scalar => Ok(Self::Literal(scalar)),
        }
    }
}

impl PropertyValue {
    fn from_map(map: serde_json::Map<String, Value>) -> std::result::Result<Self, ConfigError> {
        let mut converted = BTreeMap::new();
        for (key, value) in map {
            converted.insert(key, Self::try_from(value)?);
        }
        if converted.values().all(|v| matches!(v, Self::Literal(_))) {
            Ok(Self::Literal(Value::Object(
                converted.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )))
        } else {
            Ok(Self::Map(converted))
        }
    }
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Literal(v) => v,
            PropertyValue::Ref(r) => serde_json::json!({ "$ref": r.to_string() }),
            PropertyValue::Import(o) => serde_json::json!({ "$import": o.to_string() }),
            PropertyValue::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            PropertyValue::Map(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
            PropertyValue::Join(parts) => {
                serde_json::json!({ "$join": parts.into_iter().map(Self::from).collect::<Vec<_>>() })
            }
        }
    }
}

/// Resolves a whole property map.
///
/// # Errors
///
/// Propagates resolution errors.
pub fn resolve_properties(
    properties: &BTreeMap<String, PropertyValue>,
    source: &dyn ValueSource,
) -> Result<Option<ResolvedProperties>> {
    let mut out = ResolvedProperties::new();
    for (key, value) in properties {
        match value.resolve(source)? {
            Some(v) => {
                out.insert(key.clone(), v);
            }
            None => return Ok(None),
        }
    }
    Ok(Some(out))
}

/// One declared infrastructure resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Identity, unique within the stack.
    pub logical_id: String,
    /// Resource type tag.
    pub kind: String,
    /// Declared properties.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Removal policy.
    pub removal_policy: RemovalPolicy,
    /// Explicit dependencies (logical ids).
    pub depends_on: Vec<String>,
    /// Lifecycle hook, only on custom resources.
    pub hook: Option<LifecycleHook>,
}

impl ResourceNode {
    /// Creates a node without dependencies or hook.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        logical_id: impl Into<String>,
        properties: BTreeMap<String, PropertyValue>,
        removal_policy: RemovalPolicy,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            kind: kind.into(),
            properties,
            removal_policy,
            depends_on: Vec::new(),
            hook: None,
        }
    }

    /// True for `custom-resource` nodes.
    #[must_use]
    pub fn is_custom_resource(&self) -> bool {
        self.kind == CUSTOM_RESOURCE_KIND
    }

    /// True if a lifecycle hook is attached.
    #[must_use]
    pub const fn is_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// Distinct logical ids this node references, in first-seen order.
    #[must_use]
    pub fn referenced_nodes(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for value in self.properties.values() {
            for r in value.references() {
                if !seen.contains(&r.node.as_str()) {
                    seen.push(&r.node);
                }
            }
        }
        seen
    }

    /// Every cross-stack import in this node's properties.
    #[must_use]
    pub fn imports(&self) -> Vec<&OutputRef> {
        self.properties.values().flat_map(PropertyValue::imports).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BrokerError, DeployError};
    use serde_json::json;
    use std::collections::HashMap;

    struct MapSource {
        nodes: HashMap<String, ResolvedProperties>,
        outputs: HashMap<String, Value>,
    }

    impl ValueSource for MapSource {
        fn node_attribute(&self, reference: &Reference) -> Result<Option<Value>> {
            Ok(self
                .nodes
                .get(&reference.node)
                .and_then(|o| o.get(&reference.attribute))
                .cloned())
        }

        fn stack_output(&self, output: &OutputRef) -> Result<Option<Value>> {
            self.outputs.get(&output.to_string()).cloned().map(Some).ok_or_else(|| {
                BrokerError::OutputNotYetAvailable {
                    stack: output.stack.clone(),
                    output: output.output.clone(),
                }
                .into()
            })
        }
    }

    fn source() -> MapSource {
        let mut bucket = ResolvedProperties::new();
        bucket.insert("name".into(), json!("sample-data"));
        MapSource {
            nodes: HashMap::from([("Bucket".to_string(), bucket)]),
            outputs: HashMap::from([("AuthStack.userPoolId".to_string(), json!("pool-1"))]),
        }
    }

    #[test]
    fn test_parse_markers() {
        let value: PropertyValue = serde_json::from_value(json!({"$ref": "Bucket.name"})).unwrap();
        assert_eq!(value, PropertyValue::reference("Bucket", "name"));

        let value: PropertyValue = serde_json::from_value(json!({"$ref": "Bucket"})).unwrap();
        assert_eq!(value, PropertyValue::reference("Bucket", "id"));

        let value: PropertyValue =
            serde_json::from_value(json!({"$import": "AuthStack.userPoolId"})).unwrap();
        assert_eq!(value, PropertyValue::import("AuthStack", "userPoolId"));

        let value = PropertyValue::try_from(json!({"$ref": "Bucket.arn"})).unwrap();
        assert_eq!(value, PropertyValue::reference("Bucket", "arn"));
    }

    #[test]
    fn test_literal_subtrees_collapse() {
        let value: PropertyValue =
            serde_json::from_value(json!({"billing": "PAY_PER_REQUEST", "keys": ["id", "ts"]})).unwrap();
        assert!(matches!(value, PropertyValue::Literal(_)));

        let value: PropertyValue =
            serde_json::from_value(json!({"env": {"TABLE": {"$ref": "Table.name"}, "MODE": "x"}})).unwrap();
        assert!(matches!(value, PropertyValue::Map(_)));
        assert_eq!(value.references().len(), 1);
    }

    #[test]
    fn test_rejects_malformed_markers() {
        assert!(serde_json::from_value::<PropertyValue>(json!({"$import": "NoDot"})).is_err());
        assert!(serde_json::from_value::<PropertyValue>(json!({"$ref": 3})).is_err());
        assert!(serde_json::from_value::<PropertyValue>(json!({"$imprt": "A.b"})).is_err());
    }

    #[test]
    fn test_resolve_join() {
        let value: PropertyValue =
            serde_json::from_value(json!({"$join": ["s3://", {"$ref": "Bucket.name"}, "/"]})).unwrap();
        let resolved = value.resolve(&source()).unwrap();
        assert_eq!(resolved, Some(json!("s3://sample-data/")));
    }

    #[test]
    fn test_resolve_unknown_node_is_none() {
        let value = PropertyValue::reference("Table", "name");
        assert_eq!(value.resolve(&source()).unwrap(), None);
    }

    #[test]
    fn test_resolve_missing_import_fails() {
        let value = PropertyValue::import("WebAclStack", "webAclArn");
        let err = value.resolve(&source()).unwrap_err();
        assert!(matches!(
            err,
            DeployError::Broker(BrokerError::OutputNotYetAvailable { .. })
        ));
    }

    #[test]
    fn test_serialize_round_trip_markers() {
        let value = PropertyValue::Join(vec![
            PropertyValue::string("arn:"),
            PropertyValue::import("WebAclStack", "webAclArn"),
        ]);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, json!({"$join": ["arn:", {"$import": "WebAclStack.webAclArn"}]}));
    }

    #[test]
    fn test_referenced_nodes_are_distinct() {
        let mut props = BTreeMap::new();
        props.insert("a".into(), PropertyValue::reference("Bucket", "name"));
        props.insert("b".into(), PropertyValue::reference("Bucket", "arn"));
        props.insert("c".into(), PropertyValue::reference("Table", "id"));
        let node = ResourceNode::new("lambda-function", "Fn", props, RemovalPolicy::Destroy);
        assert_eq!(node.referenced_nodes(), vec!["Bucket", "Table"]);
        assert!(!node.is_custom_resource());
    }
}
