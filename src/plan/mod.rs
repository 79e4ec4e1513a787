//! Execution plan model
//!
//! Defines the items a run is made of: suites, tests, groups, wait
//! barriers and sleep hints, plus the assembled plan the scheduler
//! consumes.

mod depends;
mod parser;

pub use depends::resolve_dependencies;
pub use parser::{assemble, body_is_wellformed, parse_item_line, parse_items};

use std::fmt;

use thiserror::Error;

/// Errors raised while building an execution plan. All of these are fatal
/// and reported before any worker is spawned.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("a group cannot contain #WAIT")]
    WaitInGroup,

    #[error("a group cannot mix suite and test entries")]
    MixedGroup,

    #[error("'{{' encountered inside a group")]
    NestedGroup,

    #[error("'}}' encountered before '{{'")]
    UnopenedGroup,

    #[error("group left open at end of input")]
    UnclosedGroup,

    #[error("unknown #DEPENDS target '{0}'")]
    UnknownDependency(String),

    #[error("ambiguous #DEPENDS target '{0}' (give the fully qualified name)")]
    AmbiguousDependency(String),

    #[error("an item cannot depend on itself: '{0}'")]
    SelfDependency(String),

    #[error("circular #DEPENDS chain: {0}")]
    DependencyCycle(String),

    #[error("ordering item '{0}' does not match any discovered suite or test")]
    UnmatchedOrdering(String),

    #[error("ordering file lists more runnable items than were discovered")]
    OversizedOrdering,
}

/// Kind of a runnable unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Suite,
    Test,
}

impl UnitKind {
    /// Selector flag passed to the underlying runner.
    pub fn flag(self) -> &'static str {
        match self {
            UnitKind::Suite => "--suite",
            UnitKind::Test => "--test",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Suite => write!(f, "suite"),
            UnitKind::Test => write!(f, "test"),
        }
    }
}

/// One runnable suite or test, identified by its fully qualified dotted
/// name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unit {
    pub kind: UnitKind,
    pub name: String,
    /// Names of units that must pass before this one may start.
    pub depends: Vec<String>,
    /// Seconds to wait in the worker slot before spawning.
    pub sleep: u64,
}

impl Unit {
    pub fn new(kind: UnitKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            depends: Vec::new(),
            sleep: 0,
        }
    }

    pub fn suite(name: impl Into<String>) -> Self {
        Self::new(UnitKind::Suite, name)
    }

    pub fn test(name: impl Into<String>) -> Self {
        Self::new(UnitKind::Test, name)
    }

    /// First segment of the dotted name.
    pub fn top_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Render this unit back into its ordering-file line.
    pub fn line(&self) -> String {
        let mut out = format!("{} {}", self.kind.flag(), self.name);
        for dep in &self.depends {
            out.push_str(" #DEPENDS ");
            out.push_str(dep);
        }
        out
    }

    /// True when `name` names this unit exactly or by dotted suffix.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name || self.name.ends_with(&format!(".{name}"))
    }
}

/// An ordered bundle of same-kind units executed sequentially by a single
/// subprocess.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Group {
    pub members: Vec<Unit>,
    pub sleep: u64,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, rejecting kind mixing. The group's startup sleep is
    /// the maximum over its members and any sleep attached to `{`.
    pub fn push(&mut self, unit: Unit) -> Result<(), PlanError> {
        if let Some(first) = self.members.first() {
            if first.kind != unit.kind {
                return Err(PlanError::MixedGroup);
            }
        }
        self.sleep = self.sleep.max(unit.sleep);
        self.members.push(unit);
        Ok(())
    }

    pub fn kind(&self) -> Option<UnitKind> {
        self.members.first().map(|m| m.kind)
    }

    /// Synthesized name: `Group_` followed by member names joined by `_`.
    pub fn name(&self) -> String {
        let mut name = String::from("Group");
        for member in &self.members {
            name.push('_');
            name.push_str(&member.name);
        }
        name
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Reorder members so that every member runs after the members it
    /// depends on. Only dependencies between members are considered here.
    pub fn order_by_depends(&mut self) -> Result<(), PlanError> {
        let names: Vec<String> = self.members.iter().map(|m| m.name.clone()).collect();
        let mut ordered: Vec<Unit> = Vec::with_capacity(self.members.len());
        let mut remaining: Vec<Unit> = self.members.drain(..).collect();
        while !remaining.is_empty() {
            let placed: Vec<String> = ordered.iter().map(|m| m.name.clone()).collect();
            let ready: Vec<usize> = remaining
                .iter()
                .enumerate()
                .filter(|(_, m)| {
                    m.depends
                        .iter()
                        .all(|d| !names.contains(d) || placed.contains(d))
                })
                .map(|(i, _)| i)
                .collect();
            if ready.is_empty() {
                let stuck: Vec<&str> = remaining.iter().map(|m| m.name.as_str()).collect();
                return Err(PlanError::DependencyCycle(stuck.join(" -> ")));
            }
            let mut batch = Vec::with_capacity(ready.len());
            for i in ready.into_iter().rev() {
                batch.push(remaining.remove(i));
            }
            batch.reverse();
            ordered.extend(batch);
        }
        self.members = ordered;
        Ok(())
    }
}

/// Raw item produced by the line parser, in document order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanItem {
    Unit(Unit),
    Wait,
    Sleep(u64),
    GroupStart,
    GroupEnd,
}

impl PlanItem {
    /// Render back into ordering-file form.
    pub fn line(&self) -> String {
        match self {
            PlanItem::Unit(unit) => unit.line(),
            PlanItem::Wait => "#WAIT".to_string(),
            PlanItem::Sleep(secs) => format!("#SLEEP {secs}"),
            PlanItem::GroupStart => "{".to_string(),
            PlanItem::GroupEnd => "}".to_string(),
        }
    }
}

/// A single dispatchable work item after group assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchItem {
    Unit(Unit),
    Group(Group),
}

/// One schedulable entry: a payload plus its resolved dependency edges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    /// Stable id assigned at plan expansion, unique within the plan.
    pub id: usize,
    pub item: DispatchItem,
    /// Ids of dispatches that must pass before this one starts.
    pub depends: Vec<usize>,
}

impl Dispatch {
    pub fn name(&self) -> String {
        match &self.item {
            DispatchItem::Unit(unit) => unit.name.clone(),
            DispatchItem::Group(group) => group.name(),
        }
    }

    pub fn sleep(&self) -> u64 {
        match &self.item {
            DispatchItem::Unit(unit) => unit.sleep,
            DispatchItem::Group(group) => group.sleep,
        }
    }

    pub fn top_name(&self) -> String {
        match &self.item {
            DispatchItem::Unit(unit) => unit.top_name().to_string(),
            DispatchItem::Group(group) => group
                .members
                .first()
                .map(|m| m.top_name().to_string())
                .unwrap_or_default(),
        }
    }
}

/// Entry in the assembled plan consumed by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanEntry {
    Dispatch(Dispatch),
    Barrier,
}

/// A fully assembled, validated plan.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    /// Assemble raw items into a plan: attach sleeps, build groups,
    /// assign ids and resolve dependency names.
    pub fn build(items: Vec<PlanItem>) -> Result<Self, PlanError> {
        let entries = assemble(items)?;
        let entries = resolve_dependencies(entries)?;
        Ok(Self { entries })
    }

    /// Number of dispatchable entries.
    pub fn dispatch_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, PlanEntry::Dispatch(_)))
            .count()
    }

    pub fn dispatches(&self) -> impl Iterator<Item = &Dispatch> {
        self.entries.iter().filter_map(|e| match e {
            PlanEntry::Dispatch(d) => Some(d),
            PlanEntry::Barrier => None,
        })
    }

    /// Common first name segment across all units, used as the root name
    /// of the consolidated result. Empty when units disagree.
    pub fn root_name(&self) -> String {
        let mut tops = self.dispatches().map(|d| d.top_name());
        match tops.next() {
            Some(first) if !first.is_empty() && tops.all(|t| t == first) => first,
            _ => String::new(),
        }
    }
}
