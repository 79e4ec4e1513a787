//! Coordination registry
//!
//! The single mutable state behind the server: named locks with FIFO wait
//! queues, the parallel key/value store, tag-indexed value sets, run-once
//! grants and caller liveness. All methods are synchronous; the server's
//! request loop serializes access.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::coordination::protocol::{ErrorKind, Response};

const TAGS_KEY: &str = "tags";

/// Named binary semaphore with a FIFO wait queue.
#[derive(Clone, Debug)]
struct Lock {
    holder: String,
    waiters: VecDeque<String>,
}

/// Named, tagged mapping leased to at most one caller at a time. Keys and
/// tags compare ASCII case-insensitively.
#[derive(Clone, Debug)]
pub struct ValueSet {
    pub name: String,
    tags: Vec<String>,
    values: BTreeMap<String, String>,
    holder: Option<String>,
}

impl ValueSet {
    /// Build a set from a raw section mapping; the `tags` key becomes the
    /// comma-separated tag list, every other key a value.
    pub fn from_mapping(name: impl Into<String>, mapping: &BTreeMap<String, String>) -> Self {
        let mut tags = Vec::new();
        let mut values = BTreeMap::new();
        for (key, value) in mapping {
            if key.eq_ignore_ascii_case(TAGS_KEY) {
                tags = value
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect();
            } else {
                values.insert(key.to_ascii_lowercase(), value.clone());
            }
        }
        Self {
            name: name.into(),
            tags,
            values,
            holder: None,
        }
    }

    fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.to_ascii_lowercase();
        self.tags.iter().any(|t| *t == tag)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Clone, Debug)]
enum RunOnce {
    Pending { caller: String },
    Done { passed: bool },
}

/// Process-wide coordination state, reset at server startup.
#[derive(Default)]
pub struct CoordinationState {
    locks: HashMap<String, Lock>,
    parallel_values: HashMap<String, String>,
    /// Insertion order decides lease ties.
    value_sets: Vec<ValueSet>,
    run_once: HashMap<String, RunOnce>,
    last_seen: HashMap<String, Instant>,
}

impl CoordinationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed value sets from a parsed resource file.
    pub fn with_value_sets(sets: Vec<ValueSet>) -> Self {
        let mut state = Self::new();
        for set in &sets {
            debug!("imported value set '{}' with {} tag(s)", set.name, set.tags.len());
        }
        state.value_sets = sets;
        state
    }

    pub fn touch(&mut self, caller: &str) {
        self.last_seen.insert(caller.to_string(), Instant::now());
    }

    pub fn acquire_lock(&mut self, name: &str, caller: &str) -> Response {
        match self.locks.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Lock {
                    holder: caller.to_string(),
                    waiters: VecDeque::new(),
                });
                Response::Ok
            }
            Entry::Occupied(mut entry) => {
                let lock = entry.get_mut();
                if lock.holder == caller {
                    return Response::Ok;
                }
                if !lock.waiters.iter().any(|w| w == caller) {
                    lock.waiters.push_back(caller.to_string());
                }
                Response::Retry
            }
        }
    }

    pub fn release_lock(&mut self, name: &str, caller: &str) -> Response {
        let Entry::Occupied(mut entry) = self.locks.entry(name.to_string()) else {
            return Response::error(
                ErrorKind::LockNotHeld,
                format!("caller does not hold lock '{name}'"),
            );
        };
        if entry.get().holder != caller {
            return Response::error(
                ErrorKind::LockNotHeld,
                format!("caller does not hold lock '{name}'"),
            );
        }
        match entry.get_mut().waiters.pop_front() {
            Some(next) => entry.get_mut().holder = next,
            None => {
                entry.remove();
            }
        }
        Response::Ok
    }

    pub fn set_parallel_value(&mut self, key: &str, value: &str) -> Response {
        self.parallel_values
            .insert(key.to_string(), value.to_string());
        Response::Ok
    }

    pub fn get_parallel_value(&self, key: &str) -> Response {
        Response::value(
            self.parallel_values
                .get(key)
                .cloned()
                .unwrap_or_default(),
        )
    }

    pub fn acquire_value_set(&mut self, caller: &str, tag: Option<&str>) -> Response {
        if self
            .value_sets
            .iter()
            .any(|set| set.holder.as_deref() == Some(caller))
        {
            return Response::error(
                ErrorKind::AcquireWithoutRelease,
                "caller already holds a value set",
            );
        }
        let mut saw_match = false;
        for set in self.value_sets.iter_mut() {
            if let Some(tag) = tag {
                if !set.has_tag(tag) {
                    continue;
                }
            }
            saw_match = true;
            if set.holder.is_none() {
                set.holder = Some(caller.to_string());
                return Response::value(set.name.clone());
            }
        }
        if !saw_match {
            return match tag {
                Some(tag) => {
                    Response::error(ErrorKind::NoSuchTag, format!("no value set has tag '{tag}'"))
                }
                None => Response::error(
                    ErrorKind::NoSuchTag,
                    "no value sets have been imported",
                ),
            };
        }
        Response::error(
            ErrorKind::NoValueSetAvailable,
            "all matching value sets are leased",
        )
    }

    pub fn get_value_from_set(&self, key: &str, caller: &str) -> Response {
        let Some(set) = self
            .value_sets
            .iter()
            .find(|set| set.holder.as_deref() == Some(caller))
        else {
            return Response::error(
                ErrorKind::ReleaseWithoutAcquire,
                "no value set leased by caller",
            );
        };
        match set.get(key) {
            Some(value) => Response::value(value),
            None => Response::error(
                ErrorKind::NoSuchValue,
                format!("no value for key '{key}' in set '{}'", set.name),
            ),
        }
    }

    /// Clearing a lease that does not exist is a no-op.
    pub fn release_value_set(&mut self, caller: &str) -> Response {
        for set in self.value_sets.iter_mut() {
            if set.holder.as_deref() == Some(caller) {
                set.holder = None;
            }
        }
        Response::Ok
    }

    pub fn add_value_set(&mut self, name: &str, values: &BTreeMap<String, String>) -> Response {
        self.value_sets.push(ValueSet::from_mapping(name, values));
        Response::Ok
    }

    pub fn run_only_once(&mut self, id: &str, caller: &str) -> Response {
        match self.run_once.get(id).cloned() {
            None => {
                self.run_once.insert(
                    id.to_string(),
                    RunOnce::Pending {
                        caller: caller.to_string(),
                    },
                );
                Response::value("first")
            }
            Some(RunOnce::Pending { .. }) => Response::Retry,
            Some(RunOnce::Done { passed: true }) => Response::value("already"),
            Some(RunOnce::Done { passed: false }) => Response::error(
                ErrorKind::RunOnceFailed,
                format!("'{id}' failed in another process"),
            ),
        }
    }

    pub fn run_once_complete(&mut self, id: &str, caller: &str, passed: bool) -> Response {
        let granted = matches!(
            self.run_once.get(id),
            Some(RunOnce::Pending { caller: c }) if c == caller
        );
        if !granted {
            return Response::error(
                ErrorKind::ReleaseWithoutAcquire,
                format!("'{id}' is not pending for this caller"),
            );
        }
        self.run_once
            .insert(id.to_string(), RunOnce::Done { passed });
        Response::Ok
    }

    /// Forget a caller and release everything it held. Pending run-once
    /// grants are dropped so the next caller may retry as first.
    pub fn deregister(&mut self, caller: &str) -> Response {
        self.last_seen.remove(caller);

        let names: Vec<String> = self.locks.keys().cloned().collect();
        for name in names {
            let held = match self.locks.get_mut(&name) {
                Some(lock) => {
                    lock.waiters.retain(|w| w != caller);
                    lock.holder == caller
                }
                None => false,
            };
            if held {
                self.release_lock(&name, caller);
            }
        }

        self.release_value_set(caller);

        self.run_once.retain(|id, entry| match entry {
            RunOnce::Pending { caller: granted } if granted == caller => {
                warn!("run-once '{id}' abandoned by dying caller; next caller retries");
                false
            }
            _ => true,
        });
        Response::Ok
    }

    /// Drop callers that have not pinged within `interval`.
    pub fn reap_dead_callers(&mut self, interval: Duration) {
        let now = Instant::now();
        let dead: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > interval)
            .map(|(caller, _)| caller.clone())
            .collect();
        for caller in dead {
            info!("caller {caller} missed its liveness window; releasing its resources");
            self.deregister(&caller);
        }
    }

    #[cfg(test)]
    fn lock_holder(&self, name: &str) -> Option<&str> {
        self.locks.get(name).map(|l| l.holder.as_str())
    }
}

/// Parse an INI-like resource file into value sets. Section headers name
/// the sets; duplicate section names create distinct sets with the same
/// name.
pub fn parse_resource_file(text: &str) -> Vec<ValueSet> {
    let mut sets = Vec::new();
    let mut current: Option<(String, BTreeMap<String, String>)> = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            if let Some((name, mapping)) = current.take() {
                sets.push(ValueSet::from_mapping(name, &mapping));
            }
            current = Some((line[1..line.len() - 1].trim().to_string(), BTreeMap::new()));
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("ignoring malformed resource line: {line}");
            continue;
        };
        if let Some((_, mapping)) = current.as_mut() {
            mapping.insert(key.trim().to_string(), value.trim().to_string());
        } else {
            warn!("ignoring resource line outside any section: {line}");
        }
    }
    if let Some((name, mapping)) = current.take() {
        sets.push(ValueSet::from_mapping(name, &mapping));
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE: &str = "\
[Server1]
tags = server, admin
HOST = 192.168.1.1
USER = alice

[Server2]
tags = server
host = 192.168.1.2
";

    fn state_with_resource() -> CoordinationState {
        CoordinationState::with_value_sets(parse_resource_file(RESOURCE))
    }

    #[test]
    fn lock_is_exclusive_and_fifo() {
        let mut state = CoordinationState::new();
        assert_eq!(state.acquire_lock("db", "a"), Response::Ok);
        assert_eq!(state.acquire_lock("db", "b"), Response::Retry);
        assert_eq!(state.acquire_lock("db", "c"), Response::Retry);
        // Re-polling does not change queue position.
        assert_eq!(state.acquire_lock("db", "c"), Response::Retry);

        assert_eq!(state.release_lock("db", "a"), Response::Ok);
        assert_eq!(state.lock_holder("db"), Some("b"));
        assert_eq!(state.acquire_lock("db", "c"), Response::Retry);
        assert_eq!(state.acquire_lock("db", "b"), Response::Ok);

        assert_eq!(state.release_lock("db", "b"), Response::Ok);
        assert_eq!(state.acquire_lock("db", "c"), Response::Ok);
        assert_eq!(state.release_lock("db", "c"), Response::Ok);
        assert_eq!(state.lock_holder("db"), None);
    }

    #[test]
    fn releasing_unheld_lock_fails() {
        let mut state = CoordinationState::new();
        state.acquire_lock("db", "a");
        let response = state.release_lock("db", "b");
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::LockNotHeld,
                ..
            }
        ));
    }

    #[test]
    fn parallel_values_default_to_empty() {
        let mut state = CoordinationState::new();
        assert_eq!(state.get_parallel_value("missing"), Response::value(""));
        state.set_parallel_value("k", "v");
        assert_eq!(state.get_parallel_value("k"), Response::value("v"));
    }

    #[test]
    fn value_set_leasing_by_tag() {
        let mut state = state_with_resource();
        let first = state.acquire_value_set("w1", Some("server"));
        let second = state.acquire_value_set("w2", Some("SERVER"));
        let (Response::Value { value: set1 }, Response::Value { value: set2 }) = (first, second)
        else {
            panic!("expected two leases");
        };
        assert_ne!(set1, set2);

        let third = state.acquire_value_set("w3", Some("server"));
        assert!(matches!(
            third,
            Response::Error {
                kind: ErrorKind::NoValueSetAvailable,
                ..
            }
        ));

        state.release_value_set("w1");
        assert!(matches!(
            state.acquire_value_set("w3", Some("server")),
            Response::Value { .. }
        ));
    }

    #[test]
    fn unknown_tag_is_permanent_error() {
        let mut state = state_with_resource();
        assert!(matches!(
            state.acquire_value_set("w1", Some("gpu")),
            Response::Error {
                kind: ErrorKind::NoSuchTag,
                ..
            }
        ));
    }

    #[test]
    fn double_acquire_is_rejected() {
        let mut state = state_with_resource();
        state.acquire_value_set("w1", None);
        assert!(matches!(
            state.acquire_value_set("w1", None),
            Response::Error {
                kind: ErrorKind::AcquireWithoutRelease,
                ..
            }
        ));
    }

    #[test]
    fn value_lookup_is_case_insensitive() {
        let mut state = state_with_resource();
        let Response::Value { value: set } = state.acquire_value_set("w1", Some("admin")) else {
            panic!("no lease");
        };
        assert_eq!(set, "Server1");
        assert_eq!(state.get_value_from_set("host", "w1"), Response::value("192.168.1.1"));
        assert_eq!(state.get_value_from_set("HOST", "w1"), Response::value("192.168.1.1"));
        assert!(matches!(
            state.get_value_from_set("port", "w1"),
            Response::Error {
                kind: ErrorKind::NoSuchValue,
                ..
            }
        ));
    }

    #[test]
    fn get_value_without_lease_fails() {
        let mut state = state_with_resource();
        assert!(matches!(
            state.get_value_from_set("host", "w1"),
            Response::Error {
                kind: ErrorKind::ReleaseWithoutAcquire,
                ..
            }
        ));
        // Releasing without a lease is a no-op.
        assert_eq!(state.release_value_set("w1"), Response::Ok);
    }

    #[test]
    fn added_value_sets_join_the_pool() {
        let mut state = CoordinationState::new();
        let mut mapping = BTreeMap::new();
        mapping.insert("tags".to_string(), "gpu, fast".to_string());
        mapping.insert("DEVICE".to_string(), "cuda:0".to_string());
        state.add_value_set("Gpu1", &mapping);

        let Response::Value { value } = state.acquire_value_set("w1", Some("gpu")) else {
            panic!("no lease");
        };
        assert_eq!(value, "Gpu1");
        assert_eq!(state.get_value_from_set("device", "w1"), Response::value("cuda:0"));
    }

    #[test]
    fn run_only_once_grants_then_reports() {
        let mut state = CoordinationState::new();
        assert_eq!(state.run_only_once("setup", "a"), Response::value("first"));
        assert_eq!(state.run_only_once("setup", "b"), Response::Retry);
        assert_eq!(state.run_once_complete("setup", "a", true), Response::Ok);
        assert_eq!(state.run_only_once("setup", "b"), Response::value("already"));
    }

    #[test]
    fn failed_run_once_propagates() {
        let mut state = CoordinationState::new();
        state.run_only_once("setup", "a");
        state.run_once_complete("setup", "a", false);
        assert!(matches!(
            state.run_only_once("setup", "b"),
            Response::Error {
                kind: ErrorKind::RunOnceFailed,
                ..
            }
        ));
    }

    #[test]
    fn deregister_releases_everything() {
        let mut state = state_with_resource();
        state.touch("a");
        state.acquire_lock("db", "a");
        state.acquire_lock("db", "b");
        state.acquire_value_set("a", None);
        state.run_only_once("setup", "a");

        state.deregister("a");

        // The lock moved to the queued waiter.
        assert_eq!(state.acquire_lock("db", "b"), Response::Ok);
        // The lease is free again.
        assert!(matches!(
            state.acquire_value_set("b2", None),
            Response::Value { .. }
        ));
        // The abandoned grant can be retried.
        assert_eq!(state.run_only_once("setup", "b"), Response::value("first"));
    }

    #[test]
    fn dead_callers_are_reaped() {
        let mut state = CoordinationState::new();
        state.touch("a");
        state.acquire_lock("db", "a");
        std::thread::sleep(Duration::from_millis(20));
        state.reap_dead_callers(Duration::from_millis(5));
        assert_eq!(state.acquire_lock("db", "b"), Response::Ok);
    }

    #[test]
    fn resource_file_sections_become_sets() {
        let sets = parse_resource_file(RESOURCE);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].name, "Server1");
        assert!(sets[0].has_tag("ADMIN"));
        assert_eq!(sets[0].get("user"), Some("alice"));
        assert!(sets[1].has_tag("server"));
        assert!(!sets[1].has_tag("admin"));
    }

    #[test]
    fn duplicate_sections_form_a_pool() {
        let sets = parse_resource_file("[S]\ntags=t\nv=1\n[S]\ntags=t\nv=2\n");
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].name, sets[1].name);

        let mut state = CoordinationState::with_value_sets(sets);
        assert!(matches!(state.acquire_value_set("a", Some("t")), Response::Value { .. }));
        assert!(matches!(state.acquire_value_set("b", Some("t")), Response::Value { .. }));
        assert!(matches!(
            state.acquire_value_set("c", Some("t")),
            Response::Error {
                kind: ErrorKind::NoValueSetAvailable,
                ..
            }
        ));
    }
}
