//! DAG validation: run this before executing a workflow.
//!
//! Rules enforced:
//! 1. The workflow has at least one node.
//! 2. Node IDs must be unique within the workflow.
//! 3. Every edge must reference valid node IDs (both `from` and `to`), and
//!    every `steps.<id>` reference in bindings, guards and conditions must
//!    name an existing node.
//! 4. Guards, condition expressions and input templates must parse.
//! 5. The dependency graph (edges plus data references) must be acyclic.
//!
//! Returns a topologically-sorted list of node IDs on success.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::{
    ValidationError,
    expression::Expression,
    models::{NodeKind, WorkflowDefinition},
    resolver::{check_bindings, references_in},
};

/// Validate the workflow's DAG and return nodes in topological execution order.
///
/// # Errors
/// - [`ValidationError::Empty`] if there are no nodes.
/// - [`ValidationError::DuplicateNode`] if two nodes share an ID.
/// - [`ValidationError::DanglingEdge`] if an edge or reference names a missing node.
/// - [`ValidationError::InvalidGuard`], [`ValidationError::InvalidExpression`],
///   [`ValidationError::InvalidBinding`] for malformed expressions or templates.
/// - [`ValidationError::Cycle`] if the graph is not acyclic.
pub fn validate_dag(definition: &WorkflowDefinition) -> Result<Vec<String>, ValidationError> {
    if definition.nodes.is_empty() {
        return Err(ValidationError::Empty);
    }

    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut node_set: HashSet<&str> = HashSet::new();
    for node in &definition.nodes {
        if !node_set.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNode(node.id.clone()));
        }
    }

    let known = |node_id: &str, side: &'static str| {
        if node_set.contains(node_id) {
            Ok(())
        } else {
            Err(ValidationError::DanglingEdge {
                node_id: node_id.to_owned(),
                side,
            })
        }
    };

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints and guards
    // -----------------------------------------------------------------------
    for edge in &definition.edges {
        known(edge.from.as_str(), "edge source")?;
        known(edge.to.as_str(), "edge target")?;

        if let Some(guard) = &edge.guard {
            let expr = Expression::parse(guard).map_err(|e| ValidationError::InvalidGuard {
                from: edge.from.clone(),
                to: edge.to.clone(),
                message: e.to_string(),
            })?;
            for step in expr.references().iter().filter_map(|r| r.step_id()) {
                known(step, "guard")?;
            }
        }
    }

    // -----------------------------------------------------------------------
    // 3. Validate bindings and condition expressions
    // -----------------------------------------------------------------------
    for node in &definition.nodes {
        for (input, value) in &node.inputs {
            check_bindings(value).map_err(|message| ValidationError::InvalidBinding {
                node_id: node.id.clone(),
                input: input.clone(),
                message,
            })?;
        }
        for reference in references_in(&serde_json::Value::Object(node.inputs.clone())) {
            if let Some(step) = reference.step_id() {
                known(step, "input binding")?;
            }
        }

        if let NodeKind::Condition { expression } = &node.kind {
            let expr = Expression::parse(expression).map_err(|e| ValidationError::InvalidExpression {
                node_id: node.id.clone(),
                message: e.to_string(),
            })?;
            for step in expr.references().iter().filter_map(|r| r.step_id()) {
                known(step, "condition")?;
            }
        }
    }

    // -----------------------------------------------------------------------
    // 4. Topological sort (Kahn's algorithm) over all dependencies
    // -----------------------------------------------------------------------
    let deps = dependency_pairs(definition);
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for node in &definition.nodes {
        adjacency.entry(node.id.as_str()).or_default();
        in_degree.entry(node.id.as_str()).or_insert(0);
    }
    for &(from, to) in &deps {
        adjacency.entry(from).or_default().push(to);
        *in_degree.entry(to).or_insert(0) += 1;
    }

    // Seed in declaration order so the result is deterministic.
    let mut queue: VecDeque<&str> = definition
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(definition.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_owned());

        for &neighbour in &adjacency[node_id] {
            let deg = in_degree.entry(neighbour).or_insert(0);
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(neighbour);
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != definition.nodes.len() {
        let visited: HashSet<&str> = sorted.iter().map(String::as_str).collect();
        return Err(ValidationError::Cycle {
            nodes: cycle_members(&deps, &visited),
        });
    }

    Ok(sorted)
}

/// Every `(dependency, dependent)` pair: explicit edges plus the implicit
/// ones from `steps.<id>` references in inputs, conditions and guards.
/// Unknown ids are dropped; validation reports them separately.
pub(crate) fn dependency_pairs(definition: &WorkflowDefinition) -> BTreeSet<(&str, &str)> {
    let node_ids: HashMap<&str, &str> = definition
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.id.as_str()))
        .collect();
    let mut pairs = BTreeSet::new();

    for edge in &definition.edges {
        if let (Some(from), Some(to)) = (node_ids.get(edge.from.as_str()), node_ids.get(edge.to.as_str())) {
            pairs.insert((*from, *to));

            if let Some(guard) = edge.guard.as_deref().and_then(|g| Expression::parse(g).ok()) {
                for step in guard.references().iter().filter_map(|r| r.step_id()) {
                    if let Some(dep) = node_ids.get(step) {
                        pairs.insert((*dep, *to));
                    }
                }
            }
        }
    }

    for node in &definition.nodes {
        let mut steps: Vec<String> = references_in(&serde_json::Value::Object(node.inputs.clone()))
            .iter()
            .filter_map(|r| r.step_id().map(str::to_owned))
            .collect();
        if let NodeKind::Condition { expression } = &node.kind {
            if let Ok(expr) = Expression::parse(expression) {
                steps.extend(expr.references().iter().filter_map(|r| r.step_id().map(str::to_owned)));
            }
        }
        for step in steps {
            if let Some(dep) = node_ids.get(step.as_str()) {
                pairs.insert((*dep, node.id.as_str()));
            }
        }
    }

    pairs
}

/// Nodes left after peeling everything that cannot reach a cycle, sorted.
fn cycle_members(deps: &BTreeSet<(&str, &str)>, visited: &HashSet<&str>) -> Vec<String> {
    let mut remaining: BTreeSet<&str> = deps
        .iter()
        .flat_map(|(a, b)| [*a, *b])
        .filter(|id| !visited.contains(id))
        .collect();

    // Repeatedly drop nodes with no outgoing dependency inside the remainder;
    // what survives lies on (or between) cycles.
    loop {
        let sinks: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| !deps.iter().any(|(from, to)| from == id && remaining.contains(to)))
            .collect();
        if sinks.is_empty() {
            break;
        }
        for id in sinks {
            remaining.remove(id);
        }
    }

    remaining.into_iter().map(str::to_owned).collect()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, Node};
    use serde_json::json;

    fn make_node(id: &str) -> Node {
        Node::delay(id, 1)
    }

    fn make_workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowDefinition {
        WorkflowDefinition::new("test", nodes, edges)
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // A → B → C
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b"), make_node("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        );

        let sorted = validate_dag(&workflow).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_diamond_dag() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b"), make_node("c"), make_node("d")],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        );

        let sorted = validate_dag(&workflow).expect("should be valid");
        // 'a' must be first, 'd' must be last.
        assert_eq!(sorted.first().unwrap(), "a");
        assert_eq!(sorted.last().unwrap(), "d");
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn empty_workflow_is_rejected() {
        assert_eq!(validate_dag(&make_workflow(vec![], vec![])), Err(ValidationError::Empty));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let workflow = make_workflow(
            vec![make_node("a"), make_node("a")], // duplicate!
            vec![],
        );
        assert!(matches!(
            validate_dag(&workflow),
            Err(ValidationError::DuplicateNode(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let workflow = make_workflow(
            vec![make_node("a")],
            vec![Edge::new("a", "ghost")], // ghost doesn't exist
        );
        assert!(matches!(
            validate_dag(&workflow),
            Err(ValidationError::DanglingEdge { node_id, side: "edge target" }) if node_id == "ghost"
        ));
    }

    #[test]
    fn binding_referencing_missing_step_is_rejected() {
        let workflow = make_workflow(
            vec![Node::action("b", "double").input("x", json!("{{ steps.ghost.output.value }}"))],
            vec![],
        );
        assert!(matches!(
            validate_dag(&workflow),
            Err(ValidationError::DanglingEdge { node_id, side: "input binding" }) if node_id == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected_with_offending_nodes() {
        // entry → A → B → C → A  (cycle!), C → tail
        let workflow = make_workflow(
            vec![
                make_node("entry"),
                make_node("a"),
                make_node("b"),
                make_node("c"),
                make_node("tail"),
            ],
            vec![
                Edge::new("entry", "a"),
                Edge::new("a", "b"),
                Edge::new("b", "c"),
                Edge::new("c", "a"), // back-edge
                Edge::new("c", "tail"),
            ],
        );
        assert_eq!(
            validate_dag(&workflow),
            Err(ValidationError::Cycle {
                nodes: vec!["a".into(), "b".into(), "c".into()]
            })
        );
    }

    #[test]
    fn self_referencing_input_is_a_cycle() {
        let workflow = make_workflow(
            vec![Node::action("loop", "noop").input("prev", json!("{{ steps.loop.output }}"))],
            vec![],
        );
        assert!(matches!(validate_dag(&workflow), Err(ValidationError::Cycle { nodes }) if nodes == vec!["loop"]));
    }

    #[test]
    fn data_references_order_nodes_without_edges() {
        let workflow = make_workflow(
            vec![
                Node::action("b", "double").input("x", json!("{{ steps.a.output.value }}")),
                make_node("a"),
            ],
            vec![],
        );
        assert_eq!(validate_dag(&workflow).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn malformed_guard_is_rejected() {
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b")],
            vec![Edge::guarded("a", "b", "steps.a.output.ok ==")],
        );
        assert!(matches!(validate_dag(&workflow), Err(ValidationError::InvalidGuard { .. })));
    }

    #[test]
    fn escaped_multibyte_guard_returns_a_result() {
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b")],
            vec![Edge::guarded("a", "b", r"variables.name == 'caf\é'")],
        );
        let result = validate_dag(&workflow);
        assert!(matches!(result, Ok(_) | Err(ValidationError::InvalidGuard { .. })));

        let workflow = make_workflow(
            vec![make_node("a"), make_node("b")],
            vec![Edge::guarded("a", "b", r"variables.name == 'l\'été'")],
        );
        assert!(validate_dag(&workflow).is_ok());
    }

    #[test]
    fn malformed_condition_and_template_are_rejected() {
        let workflow = make_workflow(vec![Node::condition("c", "and true")], vec![]);
        assert!(matches!(validate_dag(&workflow), Err(ValidationError::InvalidExpression { .. })));

        let workflow = make_workflow(
            vec![Node::action("a", "x").input("p", json!("{{ variables.x"))],
            vec![],
        );
        assert!(matches!(
            validate_dag(&workflow),
            Err(ValidationError::InvalidBinding { input, .. }) if input == "p"
        ));
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let workflow = make_workflow(vec![make_node("solo")], vec![]);
        let sorted = validate_dag(&workflow).expect("single node should be valid");
        assert_eq!(sorted, vec!["solo"]);
    }
}
