//! Stack-level ordering.
//!
//! Stacks are grouped into waves: every stack of a wave only depends on
//! stacks of earlier waves, through imports or explicit stack
//! dependencies.

use std::collections::HashMap;

use petgraph::graph::DiGraph;

use crate::error::{GraphError, Result};
use crate::graph::{find_cycle, toposort_levels};
use crate::model::Stack;

/// Name used in errors raised by the stack-level graph.
pub const STACK_GRAPH: &str = "<stacks>";

/// Stacks grouped into dependency waves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOrder {
    /// Waves in deployment order; each wave keeps declaration order.
    pub waves: Vec<Vec<String>>,
}

impl StackOrder {
    /// All stacks in deployment order.
    #[must_use]
    pub fn flatten(&self) -> Vec<&str> {
        self.waves.iter().flatten().map(String::as_str).collect()
    }

    /// Position of the wave holding `stack`.
    #[must_use]
    pub fn wave_of(&self, stack: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.iter().any(|s| s == stack))
    }
}

/// Orders stacks into waves.
///
/// # Errors
///
/// `GraphError::UnreachableNode` if a stack depends on an undeclared stack,
/// `GraphError::CycleDetected` if stacks depend on each other in a loop.
pub fn order_stacks(stacks: &[Stack]) -> Result<StackOrder> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, _> = stacks
        .iter()
        .map(|s| (s.name(), graph.add_node(s.name())))
        .collect();

    for stack in stacks {
        let to = index[stack.name()];
        for upstream in stack.upstream_stacks() {
            let Some(&from) = index.get(upstream.as_str()) else {
                return Err(GraphError::UnreachableNode {
                    stack: STACK_GRAPH.to_string(),
                    logical_id: stack.name().to_string(),
                    missing: upstream,
                }
                .into());
            };
            graph.update_edge(from, to, ());
        }
    }

    let Some(levels) = toposort_levels(&graph) else {
        let cycle = find_cycle(&graph)
            .into_iter()
            .map(|i| graph[i].to_string())
            .collect();
        return Err(GraphError::CycleDetected {
            stack: STACK_GRAPH.to_string(),
            cycle,
        }
        .into());
    };

    Ok(StackOrder {
        waves: levels
            .into_iter()
            .map(|level| level.into_iter().map(|i| graph[i].to_string()).collect())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use crate::model::{PropertyValue, RemovalPolicy};
    use std::collections::BTreeMap;

    fn importing(name: &str, imports: &[(&str, &str)]) -> Stack {
        let mut stack = Stack::new(name);
        let props: BTreeMap<String, PropertyValue> = imports
            .iter()
            .map(|(s, o)| ((*o).to_string(), PropertyValue::import(*s, *o)))
            .collect();
        stack
            .declare("compute.function", "Handler", props, RemovalPolicy::Destroy)
            .unwrap();
        stack
    }

    #[test]
    fn test_independent_stacks_share_a_wave() {
        let stacks = vec![
            importing("AuthStack", &[]),
            importing("DataStack", &[]),
            importing("APIStack", &[("AuthStack", "userPoolId"), ("DataStack", "tableName")]),
        ];

        let order = order_stacks(&stacks).unwrap();
        assert_eq!(
            order.waves,
            vec![
                vec!["AuthStack".to_string(), "DataStack".to_string()],
                vec!["APIStack".to_string()],
            ]
        );
        assert_eq!(order.wave_of("APIStack"), Some(1));
    }

    #[test]
    fn test_explicit_stack_dependency() {
        let mut frontend = importing("FrontendStack", &[]);
        frontend.depend_on_stack("FrontendWebAclStack");
        let stacks = vec![frontend, importing("FrontendWebAclStack", &[])];

        let order = order_stacks(&stacks).unwrap();
        assert_eq!(order.flatten(), vec!["FrontendWebAclStack", "FrontendStack"]);
    }

    #[test]
    fn test_unknown_stack() {
        let stacks = vec![importing("APIStack", &[("AuthStack", "userPoolId")])];
        let err = order_stacks(&stacks).unwrap_err();
        assert!(matches!(
            err,
            DeployError::Graph(GraphError::UnreachableNode { ref missing, .. }) if missing == "AuthStack"
        ));
    }

    #[test]
    fn test_stack_cycle() {
        let stacks = vec![
            importing("A", &[("B", "out")]),
            importing("B", &[("A", "out")]),
        ];
        let err = order_stacks(&stacks).unwrap_err();
        assert!(matches!(
            err,
            DeployError::Graph(GraphError::CycleDetected { ref cycle, .. }) if cycle.len() == 3
        ));
    }
}
