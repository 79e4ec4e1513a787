//! Ordering-file grammar
//!
//! One item per line, surrounding whitespace ignored:
//!
//! ```text
//! --suite NAME [#DEPENDS NAME ...]
//! --test NAME [#DEPENDS NAME ...]
//! #WAIT
//! #SLEEP n        (0 <= n <= 3600, attaches to the next unit or '{')
//! {  ... }        (group: members share one subprocess)
//! ```
//!
//! Blank lines and lines that match none of the forms above are skipped.

use tracing::warn;

use super::{Dispatch, DispatchItem, Group, PlanEntry, PlanError, PlanItem, Unit, UnitKind};

const DEPENDS_KEYWORD: &str = "#DEPENDS";
const MAX_SLEEP_SECS: u64 = 3600;

/// Parse a single trimmed line. Returns `Ok(None)` for lines the grammar
/// ignores.
pub fn parse_item_line(line: &str, line_no: usize) -> Result<Option<PlanItem>, PlanError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix("--suite ") {
        return parse_runnable(UnitKind::Suite, rest, line_no).map(Some);
    }
    if let Some(rest) = line.strip_prefix("--test ") {
        return parse_runnable(UnitKind::Test, rest, line_no).map(Some);
    }
    if line == "#WAIT" {
        return Ok(Some(PlanItem::Wait));
    }
    if let Some(rest) = line.strip_prefix("#SLEEP ") {
        let secs: u64 = rest.trim().parse().map_err(|_| PlanError::Syntax {
            line: line_no,
            message: format!("#SLEEP value '{}' is not an integer", rest.trim()),
        })?;
        if secs > MAX_SLEEP_SECS {
            return Err(PlanError::Syntax {
                line: line_no,
                message: format!("#SLEEP value {secs} is not between 0 and {MAX_SLEEP_SECS}"),
            });
        }
        return Ok(Some(PlanItem::Sleep(secs)));
    }
    if line == "{" {
        return Ok(Some(PlanItem::GroupStart));
    }
    if line == "}" {
        return Ok(Some(PlanItem::GroupEnd));
    }
    Ok(None)
}

fn parse_runnable(kind: UnitKind, rest: &str, line_no: usize) -> Result<PlanItem, PlanError> {
    let mut parts = rest.split(DEPENDS_KEYWORD);
    let name = parts.next().unwrap_or("").trim();
    if name.is_empty() {
        return Err(PlanError::Syntax {
            line: line_no,
            message: format!("{} requires a name before {DEPENDS_KEYWORD}", kind.flag()),
        });
    }
    let mut unit = Unit::new(kind, name);
    for dep in parts {
        let dep = dep.trim();
        if dep.is_empty() {
            return Err(PlanError::Syntax {
                line: line_no,
                message: format!("empty {DEPENDS_KEYWORD} target"),
            });
        }
        unit.depends.push(dep.to_string());
    }
    Ok(PlanItem::Unit(unit))
}

/// Parse a whole ordering/cache body into raw items in document order.
pub fn parse_items(text: &str) -> Result<Vec<PlanItem>, PlanError> {
    let mut items = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(item) = parse_item_line(line, index + 1)? {
            items.push(item);
        }
    }
    Ok(items)
}

/// True when every non-blank line of a cache body parses into an item.
/// Used to detect a corrupted cache, which forces rediscovery.
pub fn body_is_wellformed(lines: &[String]) -> bool {
    lines.iter().enumerate().all(|(i, line)| {
        line.trim().is_empty() || matches!(parse_item_line(line, i + 1), Ok(Some(_)))
    })
}

/// Turn raw items into schedulable entries: attach sleep hints, assemble
/// groups, drop unattachable sleeps and empty groups.
pub fn assemble(items: Vec<PlanItem>) -> Result<Vec<PlanEntry>, PlanError> {
    let mut entries = Vec::new();
    let mut pending_sleep: Option<u64> = None;
    let mut open_group: Option<Group> = None;

    for item in items {
        match item {
            PlanItem::Sleep(secs) => {
                if pending_sleep.replace(secs).is_some() {
                    warn!("consecutive #SLEEP hints; keeping the last one");
                }
            }
            PlanItem::Wait => {
                if open_group.is_some() {
                    return Err(PlanError::WaitInGroup);
                }
                if pending_sleep.take().is_some() {
                    warn!("#SLEEP before #WAIT attaches to nothing; ignored");
                }
                entries.push(PlanEntry::Barrier);
            }
            PlanItem::GroupStart => {
                if open_group.is_some() {
                    return Err(PlanError::NestedGroup);
                }
                let mut group = Group::new();
                if let Some(secs) = pending_sleep.take() {
                    group.sleep = secs;
                }
                open_group = Some(group);
            }
            PlanItem::GroupEnd => {
                let mut group = open_group.take().ok_or(PlanError::UnopenedGroup)?;
                if group.is_empty() {
                    warn!("empty group in ordering; ignored");
                    continue;
                }
                group.order_by_depends()?;
                entries.push(PlanEntry::Dispatch(Dispatch {
                    id: 0,
                    item: DispatchItem::Group(group),
                    depends: Vec::new(),
                }));
            }
            PlanItem::Unit(mut unit) => {
                if let Some(secs) = pending_sleep.take() {
                    unit.sleep = secs;
                }
                match open_group.as_mut() {
                    Some(group) => group.push(unit)?,
                    None => entries.push(PlanEntry::Dispatch(Dispatch {
                        id: 0,
                        item: DispatchItem::Unit(unit),
                        depends: Vec::new(),
                    })),
                }
            }
        }
    }

    if open_group.is_some() {
        return Err(PlanError::UnclosedGroup);
    }
    if pending_sleep.is_some() {
        warn!("trailing #SLEEP attaches to nothing; ignored");
    }
    // A plan cannot start with a barrier: there is nothing to wait for.
    while matches!(entries.first(), Some(PlanEntry::Barrier)) {
        entries.remove(0);
    }
    dedup_barriers(&mut entries);
    Ok(entries)
}

fn dedup_barriers(entries: &mut Vec<PlanEntry>) {
    let mut i = 0;
    while i + 1 < entries.len() {
        if matches!(entries[i], PlanEntry::Barrier) && matches!(entries[i + 1], PlanEntry::Barrier)
        {
            entries.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entries: &[PlanEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| match e {
                PlanEntry::Dispatch(d) => d.name(),
                PlanEntry::Barrier => "#WAIT".to_string(),
            })
            .collect()
    }

    #[test]
    fn parses_suites_tests_and_markers() {
        let items = parse_items(
            "--suite Root.A\n--test Root.S.T #DEPENDS Root.S.U\n#WAIT\n#SLEEP 5\n{\n}\n",
        )
        .unwrap();
        assert_eq!(items.len(), 6);
        assert!(matches!(items[2], PlanItem::Wait));
        assert!(matches!(items[3], PlanItem::Sleep(5)));
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let items = parse_items("datasources:abc\n\n  \n--suite A\n#NONSENSE\n").unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn sleep_out_of_range_is_rejected() {
        assert!(parse_items("#SLEEP 3601\n").is_err());
        assert!(parse_items("#SLEEP x\n").is_err());
    }

    #[test]
    fn depends_are_split_on_keyword() {
        let items = parse_items("--test S.T1 #DEPENDS S.T2 #DEPENDS S.T3\n").unwrap();
        match &items[0] {
            PlanItem::Unit(unit) => {
                assert_eq!(unit.name, "S.T1");
                assert_eq!(unit.depends, vec!["S.T2", "S.T3"]);
            }
            other => panic!("expected unit, got {other:?}"),
        }
    }

    #[test]
    fn empty_name_before_depends_is_an_error() {
        assert!(parse_items("--test #DEPENDS S.T2\n").is_err());
    }

    #[test]
    fn sleep_attaches_to_next_unit() {
        let items = parse_items("#SLEEP 9\n--suite A\n--suite B\n").unwrap();
        let entries = assemble(items).unwrap();
        match &entries[0] {
            PlanEntry::Dispatch(d) => assert_eq!(d.sleep(), 9),
            other => panic!("unexpected {other:?}"),
        }
        match &entries[1] {
            PlanEntry::Dispatch(d) => assert_eq!(d.sleep(), 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sleep_attaches_to_group_start() {
        let items = parse_items("#SLEEP 4\n{\n--suite A\n--suite B\n}\n").unwrap();
        let entries = assemble(items).unwrap();
        match &entries[0] {
            PlanEntry::Dispatch(d) => {
                assert_eq!(d.sleep(), 4);
                assert_eq!(d.name(), "Group_A_B");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sleep_before_wait_is_discarded() {
        let items = parse_items("--suite A\n#SLEEP 3\n#WAIT\n--suite B\n").unwrap();
        let entries = assemble(items).unwrap();
        assert_eq!(names(&entries), vec!["A", "#WAIT", "B"]);
        for entry in &entries {
            if let PlanEntry::Dispatch(d) = entry {
                assert_eq!(d.sleep(), 0);
            }
        }
    }

    #[test]
    fn wait_inside_group_is_rejected() {
        let items = parse_items("{\n--suite A\n#WAIT\n}\n").unwrap();
        assert!(matches!(assemble(items), Err(PlanError::WaitInGroup)));
    }

    #[test]
    fn nested_and_unbalanced_groups_are_rejected() {
        let items = parse_items("{\n{\n").unwrap();
        assert!(matches!(assemble(items), Err(PlanError::NestedGroup)));
        let items = parse_items("}\n").unwrap();
        assert!(matches!(assemble(items), Err(PlanError::UnopenedGroup)));
        let items = parse_items("{\n--suite A\n").unwrap();
        assert!(matches!(assemble(items), Err(PlanError::UnclosedGroup)));
    }

    #[test]
    fn leading_and_double_barriers_collapse() {
        let items = parse_items("#WAIT\n--suite A\n#WAIT\n#WAIT\n--suite B\n").unwrap();
        let entries = assemble(items).unwrap();
        assert_eq!(names(&entries), vec!["A", "#WAIT", "B"]);
    }

    #[test]
    fn cache_body_wellformedness() {
        let good: Vec<String> = ["--suite A", "#WAIT", "{", "--test A.T", "}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(body_is_wellformed(&good));
        let bad: Vec<String> = ["--suite A", "not an item"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(!body_is_wellformed(&bad));
    }
}
