//! Run-scoped execution plan.
//!
//! The plan is an arena over the nodes a run will execute, in topological
//! order. Everything the scheduler needs per node (dependencies, dependents,
//! explicit inbound edges with their parsed guards) is addressed by plan
//! index, so run state lives in flat `Vec`s next to it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use store::ExecutionMode;

use crate::{
    ValidationError,
    dag::dependency_pairs,
    expression::Expression,
    models::{Node, WorkflowDefinition},
};

/// An explicit edge into a planned node.
#[derive(Debug, Clone)]
pub struct InboundEdge {
    /// Plan index of the edge source.
    pub from: usize,
    pub guard: Option<Expression>,
}

#[derive(Debug, Clone)]
struct PlannedNode {
    /// Position in `definition.nodes`.
    position: usize,
    inbound: Vec<InboundEdge>,
    deps: Vec<usize>,
    dependents: Vec<usize>,
}

/// The nodes selected by an [`ExecutionMode`], wired up by index.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    definition: Arc<WorkflowDefinition>,
    nodes: Vec<PlannedNode>,
    index: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Build the plan from a validated definition and the topological `order`
    /// returned by [`crate::validate_dag`].
    pub fn build(
        definition: Arc<WorkflowDefinition>,
        order: &[String],
        mode: &ExecutionMode,
    ) -> Result<Self, ValidationError> {
        if let Some(target) = mode.target() {
            if definition.node(target).is_none() {
                return Err(ValidationError::UnknownTarget(target.to_owned()));
            }
        }

        let pairs = dependency_pairs(&definition);
        let included: HashSet<&str> = match mode {
            ExecutionMode::Full | ExecutionMode::Resume { .. } => order.iter().map(String::as_str).collect(),
            ExecutionMode::UpTo { node_id } => ancestors_of(node_id, &pairs),
            ExecutionMode::Single { node_id } => HashSet::from([node_id.as_str()]),
        };

        let positions: HashMap<&str, usize> = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut index = HashMap::new();
        let mut nodes = Vec::new();
        for id in order.iter().filter(|id| included.contains(id.as_str())) {
            let Some(&position) = positions.get(id.as_str()) else {
                continue;
            };
            index.insert(id.clone(), nodes.len());
            nodes.push(PlannedNode {
                position,
                inbound: Vec::new(),
                deps: Vec::new(),
                dependents: Vec::new(),
            });
        }

        // A single-node run treats its target as a source.
        if !matches!(mode, ExecutionMode::Single { .. }) {
            for &(from, to) in &pairs {
                if let (Some(&f), Some(&t)) = (index.get(from), index.get(to)) {
                    nodes[t].deps.push(f);
                    nodes[f].dependents.push(t);
                }
            }

            for edge in &definition.edges {
                let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                    continue;
                };
                let guard = edge
                    .guard
                    .as_deref()
                    .map(Expression::parse)
                    .transpose()
                    .map_err(|e| ValidationError::InvalidGuard {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        message: e.to_string(),
                    })?;
                nodes[to].inbound.push(InboundEdge { from, guard });
            }
        }

        Ok(Self { definition, nodes, index })
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.definition.nodes[self.nodes[idx].position]
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.node(idx).id
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Every node this one waits for, explicit and implicit.
    pub fn deps(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].deps
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].dependents
    }

    /// Explicit edges into this node, in declaration order.
    pub fn inbound(&self, idx: usize) -> &[InboundEdge] {
        &self.nodes[idx].inbound
    }

    /// Planned node ids in execution order.
    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        (0..self.nodes.len()).map(move |i| self.id(i))
    }
}

/// `target` plus everything it transitively depends on.
fn ancestors_of<'a>(target: &'a str, pairs: &BTreeSet<(&'a str, &'a str)>) -> HashSet<&'a str> {
    let mut seen = HashSet::from([target]);
    let mut stack = vec![target];
    while let Some(current) = stack.pop() {
        for &(from, _) in pairs.iter().filter(|(_, to)| *to == current) {
            if seen.insert(from) {
                stack.push(from);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::validate_dag;
    use crate::models::Edge;
    use serde_json::json;

    fn plan(definition: WorkflowDefinition, mode: ExecutionMode) -> Result<ExecutionPlan, ValidationError> {
        let order = validate_dag(&definition)?;
        ExecutionPlan::build(Arc::new(definition), &order, &mode)
    }

    /// a → b → d, a → c (guarded), c → d, plus an unrelated `e`.
    fn branching() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "branching",
            vec![
                Node::delay("a", 1),
                Node::delay("b", 1),
                Node::delay("c", 1),
                Node::delay("d", 1),
                Node::delay("e", 1),
            ],
            vec![
                Edge::new("a", "b"),
                Edge::guarded("a", "c", "variables.enabled"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        )
    }

    #[test]
    fn full_plan_wires_deps_and_guards() {
        let plan = plan(branching(), ExecutionMode::Full).unwrap();
        assert_eq!(plan.len(), 5);

        let a = plan.index_of("a").unwrap();
        let c = plan.index_of("c").unwrap();
        let d = plan.index_of("d").unwrap();
        assert_eq!(plan.deps(c), &[a]);
        assert_eq!(plan.deps(d).len(), 2);
        assert_eq!(plan.dependents(a).len(), 2);

        let inbound = plan.inbound(c);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].from, a);
        assert_eq!(inbound[0].guard.as_ref().map(Expression::source), Some("variables.enabled"));
    }

    #[test]
    fn up_to_keeps_target_and_ancestors() {
        let plan = plan(branching(), ExecutionMode::UpTo { node_id: "c".into() }).unwrap();
        assert_eq!(plan.ids().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn up_to_follows_data_references() {
        let definition = WorkflowDefinition::new(
            "data",
            vec![
                Node::action("fetch", "http"),
                Node::action("use", "noop").input("x", json!("{{ steps.fetch.output }}")),
            ],
            vec![],
        );
        let plan = plan(definition, ExecutionMode::UpTo { node_id: "use".into() }).unwrap();
        assert_eq!(plan.ids().collect::<Vec<_>>(), vec!["fetch", "use"]);
        assert_eq!(plan.deps(1), &[0]);
    }

    #[test]
    fn single_treats_target_as_source() {
        let plan = plan(branching(), ExecutionMode::Single { node_id: "d".into() }).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.deps(0).is_empty());
        assert!(plan.inbound(0).is_empty());
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = plan(branching(), ExecutionMode::UpTo { node_id: "zz".into() }).unwrap_err();
        assert_eq!(err, ValidationError::UnknownTarget("zz".into()));
    }
}
