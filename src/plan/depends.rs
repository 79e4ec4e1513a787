//! Dependency resolution and cycle detection
//!
//! `#DEPENDS` targets must be fully qualified dotted names of top-level
//! plan entries. Group members may depend on each other (that orders the
//! group internally) but a group itself never depends on anything.

use std::collections::HashMap;

use super::{DispatchItem, PlanEntry, PlanError};

/// Assign stable ids in plan order and resolve dependency names to ids.
/// Fails on unknown, ambiguous, self or circular references.
pub fn resolve_dependencies(mut entries: Vec<PlanEntry>) -> Result<Vec<PlanEntry>, PlanError> {
    let mut next_id = 0usize;
    for entry in entries.iter_mut() {
        if let PlanEntry::Dispatch(dispatch) = entry {
            dispatch.id = next_id;
            next_id += 1;
        }
    }

    // Only top-level units are valid targets.
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for entry in &entries {
        if let PlanEntry::Dispatch(dispatch) = entry {
            if let DispatchItem::Unit(unit) = &dispatch.item {
                by_name.entry(unit.name.as_str()).or_default().push(dispatch.id);
            }
        }
    }

    let mut resolved: HashMap<usize, Vec<usize>> = HashMap::new();
    for entry in &entries {
        let PlanEntry::Dispatch(dispatch) = entry else {
            continue;
        };
        let DispatchItem::Unit(unit) = &dispatch.item else {
            continue;
        };
        let mut deps = Vec::with_capacity(unit.depends.len());
        for dep in &unit.depends {
            if dep == &unit.name {
                return Err(PlanError::SelfDependency(unit.name.clone()));
            }
            match by_name.get(dep.as_str()).map(Vec::as_slice) {
                None | Some([]) => return Err(PlanError::UnknownDependency(dep.clone())),
                Some([id]) => deps.push(*id),
                Some(_) => return Err(PlanError::AmbiguousDependency(dep.clone())),
            }
        }
        resolved.insert(dispatch.id, deps);
    }

    detect_cycles(&entries, &resolved)?;

    for entry in entries.iter_mut() {
        if let PlanEntry::Dispatch(dispatch) = entry {
            if let Some(deps) = resolved.remove(&dispatch.id) {
                dispatch.depends = deps;
            }
        }
    }
    Ok(entries)
}

fn detect_cycles(
    entries: &[PlanEntry],
    edges: &HashMap<usize, Vec<usize>>,
) -> Result<(), PlanError> {
    let names: HashMap<usize, String> = entries
        .iter()
        .filter_map(|e| match e {
            PlanEntry::Dispatch(d) => Some((d.id, d.name())),
            PlanEntry::Barrier => None,
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    let mut marks: HashMap<usize, Mark> = names.keys().map(|id| (*id, Mark::White)).collect();

    fn visit(
        id: usize,
        edges: &HashMap<usize, Vec<usize>>,
        marks: &mut HashMap<usize, Mark>,
        path: &mut Vec<usize>,
        names: &HashMap<usize, String>,
    ) -> Result<(), PlanError> {
        marks.insert(id, Mark::Grey);
        path.push(id);
        for &dep in edges.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            match marks.get(&dep).copied().unwrap_or(Mark::White) {
                Mark::Grey => {
                    let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut cycle: Vec<&str> =
                        path[start..].iter().map(|p| names[p].as_str()).collect();
                    cycle.push(names[&dep].as_str());
                    return Err(PlanError::DependencyCycle(cycle.join(" -> ")));
                }
                Mark::White => visit(dep, edges, marks, path, names)?,
                Mark::Black => {}
            }
        }
        path.pop();
        marks.insert(id, Mark::Black);
        Ok(())
    }

    let mut ids: Vec<usize> = names.keys().copied().collect();
    ids.sort_unstable();
    let mut path = Vec::new();
    for id in ids {
        if marks[&id] == Mark::White {
            visit(id, edges, &mut marks, &mut path, &names)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{parse_items, Plan};

    fn plan(text: &str) -> Result<Plan, PlanError> {
        Plan::build(parse_items(text)?)
    }

    #[test]
    fn ids_are_assigned_in_plan_order() {
        let plan = plan("--suite A\n#WAIT\n--suite B\n{\n--suite C\n--suite D\n}\n").unwrap();
        let ids: Vec<usize> = plan.dispatches().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn depends_resolve_to_ids() {
        let plan = plan("--test S.T1 #DEPENDS S.T2\n--test S.T2\n").unwrap();
        let dispatches: Vec<_> = plan.dispatches().collect();
        assert_eq!(dispatches[0].depends, vec![1]);
        assert!(dispatches[1].depends.is_empty());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = plan("--test S.T1 #DEPENDS S.Missing\n").unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency(name) if name == "S.Missing"));
    }

    #[test]
    fn duplicate_target_names_are_ambiguous() {
        let err = plan("--test S.T1 #DEPENDS S.T2\n--test S.T2\n--test S.T2\n").unwrap_err();
        assert!(matches!(err, PlanError::AmbiguousDependency(_)));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err = plan("--test S.T1 #DEPENDS S.T1\n").unwrap_err();
        assert!(matches!(err, PlanError::SelfDependency(_)));
    }

    #[test]
    fn two_item_cycle_is_named() {
        let err = plan("--test A #DEPENDS B\n--test B #DEPENDS A\n").unwrap_err();
        match err {
            PlanError::DependencyCycle(cycle) => {
                assert!(cycle.contains("A") && cycle.contains("B"), "{cycle}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn long_chain_is_not_a_cycle() {
        let plan = plan("--test A #DEPENDS B\n--test B #DEPENDS C\n--test C\n").unwrap();
        assert_eq!(plan.dispatch_count(), 3);
    }

    #[test]
    fn group_members_are_not_targets() {
        let err = plan("{\n--test S.T2\n}\n--test S.T1 #DEPENDS S.T2\n").unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency(_)));
    }
}
