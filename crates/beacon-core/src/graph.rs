//! Dependency graph analysis: cycle detection and wave partitioning.
//!
//! Edges are the union of explicit `depends_on` declarations and implicit
//! edges inferred from `${steps.X...}` references in a step's inputs and
//! config. The graph is built over same-level sibling steps; nested bodies
//! of conditional/loop steps form independent sub-graphs analyzed when the
//! parent executes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{EngineError, EngineResult};
use crate::expr::resolver;
use crate::workflow::types::WorkflowStep;

/// Analyzed execution plan for one step list.
#[derive(Debug, Clone)]
pub struct WavePlan {
    /// Step ids partitioned into waves; steps in one wave have no ordering
    /// relationship and may run concurrently.
    pub waves: Vec<Vec<String>>,

    /// Wave index per step id.
    pub wave_of: HashMap<String, usize>,

    /// Direct dependencies (explicit plus inferred) per step id.
    pub dependencies: HashMap<String, Vec<String>>,

    /// Direct dependents per step id.
    pub dependents: HashMap<String, Vec<String>>,
}

impl WavePlan {
    /// All transitive dependents of a step, used to propagate a failure to
    /// exactly the steps that can no longer run.
    pub fn transitive_dependents(&self, step_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(step_id);

        while let Some(current) = queue.pop_front() {
            if let Some(next) = self.dependents.get(current) {
                for dep in next {
                    if seen.insert(dep.clone()) {
                        queue.push_back(dep);
                    }
                }
            }
        }
        seen
    }
}

/// Build the dependency graph for a list of sibling steps and partition it
/// into waves. Fails with the full ordered cycle on a cyclic graph.
pub fn analyze(steps: &[WorkflowStep]) -> EngineResult<WavePlan> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    // Explicit edges first, then implicit ${steps.X...} references that
    // name a same-level sibling. BTreeMap keeps traversal deterministic.
    let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for step in steps {
        let mut deps: Vec<String> = Vec::new();
        for dep in &step.depends_on {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        for expr in step.expression_strings() {
            for referenced in resolver::referenced_step_ids(expr) {
                if referenced != step.id
                    && ids.contains(referenced.as_str())
                    && !deps.contains(&referenced)
                {
                    deps.push(referenced);
                }
            }
        }
        dependencies.insert(step.id.clone(), deps);
    }

    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for step in steps {
        dependents.entry(step.id.clone()).or_default();
    }
    for (id, deps) in &dependencies {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    detect_cycle(steps, &dependencies)?;

    // Kahn layering: wave 0 holds steps with no predecessors; wave k holds
    // steps whose predecessors all sit in waves < k.
    let mut wave_of: HashMap<String, usize> = HashMap::new();
    let mut remaining: Vec<&WorkflowStep> = steps.iter().collect();
    let mut waves: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let mut current: Vec<String> = Vec::new();
        for step in &remaining {
            let deps = &dependencies[&step.id];
            if deps.iter().all(|d| wave_of.contains_key(d)) {
                current.push(step.id.clone());
            }
        }

        // Cycle detection above guarantees progress.
        debug_assert!(!current.is_empty());
        if current.is_empty() {
            return Err(EngineError::Internal(
                "wave partition stalled on an acyclic graph".to_string(),
            ));
        }

        let wave_index = waves.len();
        for id in &current {
            wave_of.insert(id.clone(), wave_index);
        }
        remaining.retain(|s| !wave_of.contains_key(&s.id));
        waves.push(current);
    }

    Ok(WavePlan {
        waves,
        wave_of,
        dependencies: dependencies.into_iter().collect(),
        dependents,
    })
}

/// Depth-first search with an explicit recursion stack; on a back edge the
/// error reports the full ordered id sequence of the cycle.
fn detect_cycle(
    steps: &[WorkflowStep],
    dependencies: &BTreeMap<String, Vec<String>>,
) -> EngineResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        dependencies: &'a BTreeMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> EngineResult<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Err(EngineError::CycleDetected(cycle));
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(deps) = dependencies.get(id) {
            for dep in deps {
                visit(dep, dependencies, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for step in steps {
        visit(&step.id, dependencies, &mut marks, &mut stack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::StepKind;
    use std::collections::BTreeMap as Map;

    fn script_step(id: &str, depends_on: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            kind: StepKind::Script {
                script: format!("scripts/{id}.sh"),
                timeout_ms: None,
            },
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            inputs: Map::new(),
            retry_policy: None,
        }
    }

    fn step_with_input(id: &str, input_expr: &str) -> WorkflowStep {
        let mut step = script_step(id, &[]);
        step.inputs
            .insert("value".to_string(), serde_json::json!(input_expr));
        step
    }

    #[test]
    fn test_waves_diamond() {
        // a -> {b, c} -> d
        let steps = vec![
            script_step("a", &[]),
            script_step("b", &["a"]),
            script_step("c", &["a"]),
            script_step("d", &["b", "c"]),
        ];

        let plan = analyze(&steps).unwrap();
        assert_eq!(plan.waves.len(), 3);
        assert_eq!(plan.wave_of["a"], 0);
        assert_eq!(plan.wave_of["b"], 1);
        assert_eq!(plan.wave_of["c"], 1);
        assert_eq!(plan.wave_of["d"], 2);
    }

    #[test]
    fn test_wave_index_exceeds_every_dependency() {
        let steps = vec![
            script_step("a", &[]),
            script_step("b", &["a"]),
            script_step("c", &[]),
            script_step("d", &["b", "c"]),
        ];

        let plan = analyze(&steps).unwrap();
        for (id, deps) in &plan.dependencies {
            for dep in deps {
                assert!(plan.wave_of[id] > plan.wave_of[dep], "{id} not after {dep}");
            }
        }
    }

    #[test]
    fn test_implicit_edge_from_expression() {
        let steps = vec![
            script_step("fetch", &[]),
            step_with_input("report", "${steps.fetch.outputs.data}"),
        ];

        let plan = analyze(&steps).unwrap();
        assert_eq!(plan.dependencies["report"], vec!["fetch".to_string()]);
        assert_eq!(plan.wave_of["report"], 1);
    }

    #[test]
    fn test_cycle_reports_ordered_sequence() {
        let steps = vec![
            script_step("a", &["c"]),
            script_step("b", &["a"]),
            script_step("c", &["b"]),
        ];

        let err = analyze(&steps).unwrap_err();
        match err {
            EngineError::CycleDetected(cycle) => {
                assert!(cycle.len() >= 4);
                assert_eq!(cycle.first(), cycle.last());
                for id in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|s| s == id), "cycle missing {id}");
                }
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let steps = vec![script_step("a", &["a"])];
        assert!(matches!(
            analyze(&steps),
            Err(EngineError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let steps = vec![
            script_step("a", &[]),
            script_step("b", &["a"]),
            script_step("c", &["b"]),
            script_step("d", &[]),
        ];

        let plan = analyze(&steps).unwrap();
        let downstream = plan.transitive_dependents("a");
        assert!(downstream.contains("b"));
        assert!(downstream.contains("c"));
        assert!(!downstream.contains("d"));
    }
}
