//! Reachability walks over the completed transition system.
//!
//! All walks are breadth-first work lists; a state without a transition map
//! entry is a sink. The first path found to a state is the one recorded.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use anyhow::Error;

use super::{AccessMode, Analysis, Label, State};

/// A path through the transition system as `(predecessor, label)` pairs,
/// starting at the walk's start state. The reached state is the map key the
/// trace is stored under.
pub type Trace = Vec<(State, Label)>;

/// Map each reachable state to one label path from `start`.
pub fn reachable_states(analysis: &Analysis, start: &State) -> HashMap<State, Vec<Label>> {
    reachable_states_entries(analysis, start)
        .into_iter()
        .map(|(state, trace)| {
            let labels = trace.into_iter().map(|(_, label)| label).collect();
            (state, labels)
        })
        .collect()
}

/// Map each reachable state to one full `(predecessor, label)` path from
/// `start`.
pub fn reachable_states_entries(analysis: &Analysis, start: &State) -> HashMap<State, Trace> {
    let mut result: HashMap<State, Trace> = HashMap::new();
    let mut queue: VecDeque<State> = VecDeque::new();
    result.insert(start.clone(), Vec::new());
    queue.push_back(start.clone());

    while let Some(state) = queue.pop_front() {
        let edges = match analysis.trans_map.get(&state) {
            Some(edges) => edges,
            None => continue,
        };
        let trace = result.get(&state).cloned().unwrap_or_default();
        for (label, target) in edges {
            if result.contains_key(target) {
                continue;
            }
            let mut next = trace.clone();
            next.push((state.clone(), label.clone()));
            result.insert(target.clone(), next);
            queue.push_back(target.clone());
        }
    }

    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Read,
    Write,
}

/// Two-phase search: walk from `start` in READ phase until a state where
/// `target` is readable, WRITE phase from there on; collect the writable
/// objects of every WRITE-phase state, annotated with the contributing
/// state and the trace reaching it. A state may be visited once per phase.
pub fn reachable_write_objects(
    analysis: &Analysis,
    start: &State,
    target: &str,
) -> Result<BTreeMap<String, Vec<(State, Trace)>>, Error> {
    let mut objects: BTreeMap<String, Vec<(State, Trace)>> = BTreeMap::new();
    let mut visited: HashSet<(State, Phase)> = HashSet::new();
    let mut queue: VecDeque<(State, Phase, Trace)> = VecDeque::new();

    let phase = if analysis.check(start, target, AccessMode::Read)? {
        Phase::Write
    } else {
        Phase::Read
    };
    visited.insert((start.clone(), phase));
    queue.push_back((start.clone(), phase, Vec::new()));

    while let Some((state, phase, trace)) = queue.pop_front() {
        if phase == Phase::Write {
            for (object, perm) in analysis.state_objects(&state)? {
                if perm.writable() {
                    objects
                        .entry(object)
                        .or_default()
                        .push((state.clone(), trace.clone()));
                }
            }
        }

        let edges = match analysis.trans_map.get(&state) {
            Some(edges) => edges,
            None => continue,
        };
        for (label, succ) in edges {
            let succ_phase = if phase == Phase::Write
                || analysis.check(succ, target, AccessMode::Read)?
            {
                Phase::Write
            } else {
                Phase::Read
            };
            if !visited.insert((succ.clone(), succ_phase)) {
                continue;
            }
            let mut next = trace.clone();
            next.push((state.clone(), label.clone()));
            queue.push_back((succ.clone(), succ_phase, next));
        }
    }

    Ok(objects)
}

/// Single-phase walk recording, for every reachable state, the objects
/// accessible there with `mode`, annotated with the state and the trace to
/// it.
pub fn trace_to_perm(
    analysis: &Analysis,
    start: &State,
    mode: AccessMode,
) -> Result<BTreeMap<String, Vec<(State, Trace)>>, Error> {
    let mut reach: Vec<(State, Trace)> =
        reachable_states_entries(analysis, start).into_iter().collect();
    reach.sort();

    let mut result: BTreeMap<String, Vec<(State, Trace)>> = BTreeMap::new();
    for (state, trace) in reach {
        for (object, perm) in analysis.state_objects(&state)? {
            if mode.allows(perm) {
                result
                    .entry(object)
                    .or_default()
                    .push((state.clone(), trace.clone()));
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analyze::AnalysisOptions;

    // u1 can read /secret and write /tmp; u2 can only read /tmp (and holds
    // no capabilities, so it cannot change identity)
    const POLICY: &str = "\
role u1 u
subject /
\t/ h
\t/secret r
\t/tmp rw
role u2 u
subject /
\t/ h
\t/tmp r
\t-CAP_ALL
";

    fn analysis() -> Analysis {
        Analysis::from_policy_text(POLICY, AnalysisOptions::default()).unwrap()
    }

    #[test]
    fn test_reachable_states_includes_start() {
        let a = analysis();
        let start = State::new("_", "u1", "_", "/");
        let reach = reachable_states(&a, &start);
        assert_eq!(reach.get(&start), Some(&Vec::new()));
        // u1 holds the full capability universe, so set_UID(u2) is reachable
        let u2 = State::new("_", "u2", "_", "/");
        assert!(reach.contains_key(&u2));
    }

    #[test]
    fn test_entry_traces_are_consistent() {
        let a = analysis();
        let start = State::new("_", "u1", "_", "/");
        for (state, trace) in reachable_states_entries(&a, &start) {
            // a trace replays from the start state to the reached state
            if trace.is_empty() {
                assert_eq!(state, start);
                continue;
            }
            assert_eq!(trace[0].0, start);
            for step in trace.windows(2) {
                let (ref pred, ref label) = step[0];
                let edges = &a.trans_map[pred];
                assert!(edges.iter().any(|(l, t)| l == label && *t == step[1].0));
            }
            let (ref pred, ref label) = trace[trace.len() - 1];
            let edges = &a.trans_map[pred];
            assert!(edges.iter().any(|(l, t)| l == label && *t == state));
        }
    }

    #[test]
    fn test_two_phase_write_search() -> Result<(), Error> {
        let a = analysis();
        let start = State::new("_", "u1", "_", "/");
        // /secret is readable at the start, so the walk begins in WRITE
        // phase and immediately reports /tmp
        let objects = reachable_write_objects(&a, &start, "/secret")?;
        assert!(objects.contains_key("/tmp"));

        // from u2 the target is never readable, so nothing is collected
        let start = State::new("_", "u2", "_", "/");
        let objects = reachable_write_objects(&a, &start, "/secret")?;
        assert!(objects.is_empty());
        Ok(())
    }

    #[test]
    fn test_trace_to_perm() -> Result<(), Error> {
        let a = analysis();
        let start = State::new("_", "u1", "_", "/");
        let writable = trace_to_perm(&a, &start, AccessMode::Write)?;
        assert!(writable.contains_key("/tmp"));
        assert!(!writable.contains_key("/secret"));
        let readable = trace_to_perm(&a, &start, AccessMode::Read)?;
        assert!(readable.contains_key("/secret"));
        Ok(())
    }
}
