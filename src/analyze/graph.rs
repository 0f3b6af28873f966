//! RBAC state space and labelled transition relation.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use anyhow::Error;
use log::debug;

use crate::policy::{RoleKind, DONTCARE};

use super::perms::CapSet;
use super::Analysis;

/// One RBAC state: the active special/user/group roles (or `_`) and the
/// executing subject path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct State {
    pub special: String,
    pub user: String,
    pub group: String,
    pub subject: String,
}

impl State {
    pub fn new(special: &str, user: &str, group: &str, subject: &str) -> Self {
        Self {
            special: special.to_string(),
            user: user.to_string(),
            group: group.to_string(),
            subject: subject.to_string(),
        }
    }
}

/// Edge label of the transition relation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Label {
    SetRole(String),
    SetUid(String),
    SetGid(String),
    Exec(String),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Label::SetRole(role) => write!(f, "set_role({})", role),
            Label::SetUid(user) => write!(f, "set_UID({})", user),
            Label::SetGid(group) => write!(f, "set_GID({})", group),
            Label::Exec(path) => write!(f, "exec({})", path),
        }
    }
}

pub type TransMap = HashMap<State, Vec<(Label, State)>>;

/// Materialise the reachable state set and transition relation by fixed
/// point iteration over a work list.
///
/// States whose effective role is blacklisted get no transition map entry;
/// edges whose target would have a blacklisted effective role are not
/// generated.
pub(crate) fn build(analysis: &mut Analysis) -> Result<(), Error> {
    let mut queue: VecDeque<State> = VecDeque::new();
    let mut states: HashSet<State> = HashSet::new();
    let mut trans_map: TransMap = HashMap::new();

    let mut specials: BTreeSet<String> = analysis
        .roles
        .iter()
        .filter(|(name, kind)| {
            **kind == RoleKind::Special && !analysis.blacklist.contains(*name)
        })
        .map(|(name, _)| name.clone())
        .collect();
    specials.insert(DONTCARE.to_string());

    let mut users: BTreeSet<String> = analysis
        .roles
        .iter()
        .filter(|(_, kind)| **kind == RoleKind::User)
        .map(|(name, _)| name.clone())
        .collect();
    users.insert(DONTCARE.to_string());

    let mut groups: BTreeSet<String> = analysis
        .roles
        .iter()
        .filter(|(_, kind)| **kind == RoleKind::Group)
        .map(|(name, _)| name.clone())
        .collect();
    groups.insert(DONTCARE.to_string());

    for special in &specials {
        for user in &users {
            for group in &groups {
                for subject in &analysis.subjects {
                    let state = State::new(special, user, group, subject);
                    if states.insert(state.clone()) {
                        queue.push_back(state);
                    }
                }
            }
        }
    }

    while let Some(state) = queue.pop_front() {
        let (role, _) = analysis.effective_role(&state);
        if analysis.blacklist.contains(&role) {
            continue;
        }
        let edges = state_edges(analysis, &state, &role)?;
        let entry = trans_map.entry(state).or_default();
        for (label, target) in edges {
            if states.insert(target.clone()) {
                queue.push_back(target.clone());
            }
            entry.push((label, target));
        }
    }

    debug!(
        "transition system: {} states, {} transition sources",
        states.len(),
        trans_map.len()
    );
    analysis.states = states;
    analysis.trans_map = trans_map;
    Ok(())
}

fn state_edges(
    analysis: &Analysis,
    state: &State,
    role: &str,
) -> Result<Vec<(Label, State)>, Error> {
    // a role without object-bearing subjects cannot act at all
    let sc = match analysis.subject_match(role, &state.subject)? {
        Some(sc) => sc.to_string(),
        None => return Ok(Vec::new()),
    };
    let mut edges = Vec::new();

    // role transitions, DONTCARE always permitted
    let mut targets: BTreeSet<String> = analysis
        .role_transitions
        .get(role)
        .cloned()
        .unwrap_or_default();
    targets.insert(DONTCARE.to_string());
    for target in targets {
        if target != DONTCARE && !analysis.roles.contains_key(&target) {
            debug!("role '{}' allows transition to undeclared role '{}'", role, target);
            continue;
        }
        let next = State {
            special: target.clone(),
            ..state.clone()
        };
        push_edge(analysis, &mut edges, Label::SetRole(target), next);
    }

    let key = (role.to_string(), sc.clone());
    let caps = analysis
        .tables
        .caps
        .get(&key)
        .copied()
        .unwrap_or_else(CapSet::empty);

    // user transitions require CAP_SETUID on the matched subject
    if caps.contains(CapSet::SETUID) {
        if let Some(users) = analysis.tables.user_trans.get(&key) {
            for user in users {
                let next = State {
                    user: analysis.user_slot(user),
                    ..state.clone()
                };
                push_edge(analysis, &mut edges, Label::SetUid(user.clone()), next);
            }
        }
    }

    // group transitions require CAP_SETGID
    if caps.contains(CapSet::SETGID) {
        if let Some(groups) = analysis.tables.grp_trans.get(&key) {
            for group in groups {
                let next = State {
                    group: analysis.group_slot(group),
                    ..state.clone()
                };
                push_edge(analysis, &mut edges, Label::SetGid(group.clone()), next);
            }
        }
    }

    // identities a set-UID/GID binary may assume in normal exec mode
    let mut exec_users: BTreeSet<String> = analysis
        .tables
        .user_trans
        .get(&key)
        .cloned()
        .unwrap_or_default();
    exec_users.insert(state.user.clone());
    let mut exec_groups: BTreeSet<String> = analysis
        .tables
        .grp_trans
        .get(&key)
        .cloned()
        .unwrap_or_default();
    exec_groups.insert(state.group.clone());

    // exec transitions through executable objects
    let objects: Vec<String> = analysis
        .tables
        .objects(role, &sc)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default();
    for object in objects {
        let perm = match analysis.tables.perm(role, &sc, &object) {
            Some(perm) => perm,
            None => continue,
        };
        if !perm.executable() {
            continue;
        }
        for target_subject in exec_image(analysis, role, &sc, &object) {
            if analysis.options.best_case_exec {
                let next = State {
                    subject: target_subject.clone(),
                    ..state.clone()
                };
                push_edge(analysis, &mut edges, Label::Exec(object.clone()), next);
                continue;
            }

            // a set-UID/GID binary changes identity without a capability
            // check
            for user in &exec_users {
                for group in &exec_groups {
                    let next = State {
                        special: state.special.clone(),
                        user: analysis.user_slot(user),
                        group: analysis.group_slot(group),
                        subject: target_subject.clone(),
                    };
                    push_edge(analysis, &mut edges, Label::Exec(object.clone()), next);
                }
            }
        }
    }

    Ok(edges)
}

/// The subjects an exec of `object` may land in: every subject the object
/// path covers whose governing object entry is `object` itself, plus the
/// greatest declared subject matching the object path.
fn exec_image(analysis: &Analysis, role: &str, sc: &str, object: &str) -> BTreeSet<String> {
    let mut image = BTreeSet::new();
    for subject in &analysis.subjects {
        if !analysis.cache.matches(object, subject) {
            continue;
        }
        if analysis.object_match(role, sc, subject) == Some(object) {
            image.insert(subject.clone());
        }
    }
    if let Some(fallback) = analysis.cache.gmp(analysis.subjects.iter(), object) {
        image.insert(fallback.to_string());
    }
    image
}

fn push_edge(
    analysis: &Analysis,
    edges: &mut Vec<(Label, State)>,
    label: Label,
    target: State,
) {
    let (role, _) = analysis.effective_role(&target);
    if analysis.blacklist.contains(&role) {
        return;
    }
    edges.push((label, target));
}
