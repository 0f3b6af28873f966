//! Policy compilation and flow analysis.
//!
//! [Analysis::build] compiles expanded role declarations into the frozen
//! permission tables and the labelled transition system; the [reach] and
//! [flows] modules run read-only searches over the result.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{bail, Error};
use log::debug;

use crate::policy::{self, RoleDecl, RoleKind, DONTCARE};

pub mod flows;
pub mod graph;
pub mod pathmatch;
pub mod perms;
pub mod reach;

pub use graph::{Label, State, TransMap};
pub use perms::{AccessMode, CapSet, PermSet};

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisOptions {
    /// Keep administrative (`A` flag) roles reachable.
    pub allow_admin_roles: bool,
    /// Assume no set-UID/GID binaries: exec transitions keep the current
    /// user and group identity.
    pub best_case_exec: bool,
}

/// The compiled policy: role and permission tables plus the materialised
/// transition system. Built once, then only read.
pub struct Analysis {
    pub roles: BTreeMap<String, RoleKind>,
    pub role_transitions: BTreeMap<String, BTreeSet<String>>,
    /// Roles excluded from the search.
    pub blacklist: BTreeSet<String>,
    pub tables: perms::PermTables,
    /// Every declared subject path, across all roles.
    pub subjects: BTreeSet<String>,
    pub states: HashSet<State>,
    pub trans_map: TransMap,
    pub options: AnalysisOptions,
    /// Per-role subject paths that carry at least one object; the domain of
    /// [Analysis::subject_match].
    role_object_subjects: BTreeMap<String, Vec<String>>,
    cache: pathmatch::PatternCache,
}

impl Analysis {
    /// Compile parsed role declarations into the full analysis value.
    pub fn build(decls: Vec<RoleDecl>, options: AnalysisOptions) -> Result<Self, Error> {
        let roles = policy::expand_domains(decls)?;

        let mut cache = pathmatch::PatternCache::new();
        let tables = perms::build_tables(&roles, &mut cache)?;

        let mut role_kinds = BTreeMap::new();
        let mut role_transitions = BTreeMap::new();
        let mut blacklist = BTreeSet::new();
        for role in &roles {
            role_kinds.insert(role.name.clone(), role.kind);
            role_transitions.insert(
                role.name.clone(),
                role.transitions.iter().cloned().collect::<BTreeSet<_>>(),
            );
            if role.admin && !options.allow_admin_roles {
                blacklist.insert(role.name.clone());
            }
        }
        if !blacklist.is_empty() {
            debug!("blacklisted administrative roles: {:?}", blacklist);
        }

        let subjects: BTreeSet<String> = roles
            .iter()
            .flat_map(|role| role.subjects.iter().map(|s| s.path.clone()))
            .collect();

        let mut role_object_subjects: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for ((role, subject), objects) in &tables.role_subject_objects {
            if !objects.is_empty() {
                role_object_subjects
                    .entry(role.clone())
                    .or_default()
                    .push(subject.clone());
            }
        }
        for subjects in role_object_subjects.values_mut() {
            subjects.sort();
        }

        let mut analysis = Analysis {
            roles: role_kinds,
            role_transitions,
            blacklist,
            tables,
            subjects,
            states: HashSet::new(),
            trans_map: HashMap::new(),
            options,
            role_object_subjects,
            cache,
        };
        graph::build(&mut analysis)?;
        Ok(analysis)
    }

    /// Convenience constructor for an in-memory policy buffer: preprocess
    /// (sans includes), parse and build.
    pub fn from_policy_text(text: &str, options: AnalysisOptions) -> Result<Self, Error> {
        let text = policy::preprocess::expand_str(text)?;
        let decls = policy::parser::PolicyParser::new(&text).parse()?;
        Self::build(decls, options)
    }

    /// Effective role of a state: scan special, user, group; skip `_` and
    /// names without a special/user/group kind; default otherwise.
    pub fn effective_role(&self, state: &State) -> (String, RoleKind) {
        for slot in [&state.special, &state.user, &state.group] {
            if slot == DONTCARE {
                continue;
            }
            if let Some(kind) = self.roles.get(slot) {
                match kind {
                    RoleKind::Special | RoleKind::User | RoleKind::Group => {
                        return (slot.clone(), *kind);
                    }
                    RoleKind::Default => continue,
                }
            }
        }
        ("default".to_string(), RoleKind::Default)
    }

    /// The declared subject of `role` governing the path `subject`: the
    /// greatest matching object-bearing subject path.
    ///
    /// A role without any object-bearing subject (notably an undeclared
    /// `default` role) matches nothing: states under it are dead, which is
    /// not an error. A role that declares subjects none of which cover
    /// `subject` is a policy defect and fatal.
    pub fn subject_match(&self, role: &str, subject: &str) -> Result<Option<&str>, Error> {
        let candidates = match self.role_object_subjects.get(role) {
            Some(candidates) => candidates,
            None => return Ok(None),
        };
        match self.cache.gmp(candidates.iter(), subject) {
            Some(path) => Ok(Some(path)),
            None => bail!(
                "no declared subject of role '{}' matches '{}'",
                role,
                subject
            ),
        }
    }

    /// The object entry of `(role, sc)` governing `path`, if any.
    pub fn object_match(&self, role: &str, sc: &str, path: &str) -> Option<&str> {
        let objects = self.tables.objects(role, sc)?;
        self.cache.gmp(objects.iter(), path)
    }

    /// Permission flags governing `path` in `state`; `None` when nothing
    /// matches (not permitted, never an error).
    pub fn perm_at(&self, state: &State, path: &str) -> Result<Option<PermSet>, Error> {
        let (role, _) = self.effective_role(state);
        let sc = match self.subject_match(&role, &state.subject)? {
            Some(sc) => sc,
            None => return Ok(None),
        };
        let object = match self.object_match(&role, sc, path) {
            Some(object) => object.to_string(),
            None => return Ok(None),
        };
        Ok(self.tables.perm(&role, sc, &object))
    }

    /// Whether `path` is accessible with `mode` from `state`.
    pub fn check(&self, state: &State, path: &str, mode: AccessMode) -> Result<bool, Error> {
        Ok(match self.perm_at(state, path)? {
            Some(perm) => mode.allows(perm),
            None => false,
        })
    }

    /// The object paths visible from `state`, with their permissions.
    pub fn state_objects(&self, state: &State) -> Result<Vec<(String, PermSet)>, Error> {
        let (role, _) = self.effective_role(state);
        let sc = match self.subject_match(&role, &state.subject)? {
            Some(sc) => sc.to_string(),
            None => return Ok(Vec::new()),
        };
        let mut result = Vec::new();
        if let Some(objects) = self.tables.objects(&role, &sc) {
            for object in objects {
                if let Some(perm) = self.tables.perm(&role, &sc, object) {
                    result.push((object.clone(), perm));
                }
            }
        }
        Ok(result)
    }

    /// User slot value after transitioning to `user`: non-user-role targets
    /// (including `_`) clear the slot.
    pub(crate) fn user_slot(&self, user: &str) -> String {
        match self.roles.get(user) {
            Some(RoleKind::User) => user.to_string(),
            _ => DONTCARE.to_string(),
        }
    }

    pub(crate) fn group_slot(&self, group: &str) -> String {
        match self.roles.get(group) {
            Some(RoleKind::Group) => group.to_string(),
            _ => DONTCARE.to_string(),
        }
    }

    /// Render a state as `role:K:subject` with the effective role and its
    /// kind letter.
    pub fn format_state(&self, state: &State) -> String {
        let (role, kind) = self.effective_role(state);
        format!("{}:{}:{}", role, kind.letter(), state.subject)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const POLICY: &str = "\
role admin sA
subject /
\t/ rwx
role alice u
role_transitions admin
subject /
\t/ h
\t/etc r
subject /usr
\t/usr/bin/sh x
";

    fn analysis(options: AnalysisOptions) -> Analysis {
        Analysis::from_policy_text(POLICY, options).unwrap()
    }

    #[test]
    fn test_effective_role() {
        let a = analysis(AnalysisOptions::default());
        let state = State::new("_", "alice", "_", "/");
        assert_eq!(a.effective_role(&state).0, "alice");
        // the special slot wins over user and group
        let state = State::new("admin", "alice", "_", "/");
        assert_eq!(a.effective_role(&state).0, "admin");
        let state = State::new("_", "_", "_", "/");
        assert_eq!(a.effective_role(&state), ("default".to_string(), RoleKind::Default));
    }

    #[test]
    fn test_subject_match_longest_prefix() {
        let a = analysis(AnalysisOptions::default());
        assert_eq!(
            a.subject_match("alice", "/usr/local/bin").unwrap(),
            Some("/usr")
        );
        assert_eq!(a.subject_match("alice", "/etc/passwd").unwrap(), Some("/"));
        // a role that never appears declares no subjects and matches nothing
        assert_eq!(a.subject_match("nobody", "/").unwrap(), None);
    }

    #[test]
    fn test_unmatched_subject_is_fatal() {
        // narrow declares subjects, but none of them covers /var, which
        // enters the state space through the other role
        let policy = "\
role narrow u
subject /usr
\t/usr r
role other u
subject /var
\t/var r
";
        assert!(Analysis::from_policy_text(policy, AnalysisOptions::default()).is_err());
    }

    #[test]
    fn test_predicates() -> Result<(), Error> {
        let a = analysis(AnalysisOptions::default());
        let state = State::new("_", "alice", "_", "/");
        // /etc r beats the hidden root object by prefix length
        assert!(a.check(&state, "/etc/passwd", AccessMode::Read)?);
        // the hidden root object suppresses everything else
        assert!(!a.check(&state, "/var/log", AccessMode::Read)?);
        assert!(!a.check(&state, "/var/log", AccessMode::Write)?);
        Ok(())
    }

    #[test]
    fn test_admin_blacklisted_by_default() {
        let a = analysis(AnalysisOptions::default());
        assert!(a.blacklist.contains("admin"));
        assert!(!a
            .states
            .iter()
            .any(|s| s.special == "admin" && a.trans_map.contains_key(s)));

        let a = analysis(AnalysisOptions {
            allow_admin_roles: true,
            ..Default::default()
        });
        assert!(a.blacklist.is_empty());
        let admin_state = State::new("admin", "_", "_", "/");
        assert!(a.trans_map.contains_key(&admin_state));
    }

    #[test]
    fn test_graph_construction_is_idempotent() {
        let a1 = analysis(AnalysisOptions::default());
        let a2 = analysis(AnalysisOptions::default());
        assert_eq!(a1.states, a2.states);
        assert_eq!(a1.trans_map.len(), a2.trans_map.len());
        for (state, edges) in &a1.trans_map {
            assert_eq!(Some(edges), a2.trans_map.get(state));
        }
    }

    #[test]
    fn test_set_uid_edges_respect_capabilities() {
        // alice keeps the full capability universe (no deltas), so set_UID
        // edges exist; after -CAP_ALL they must disappear
        let a = analysis(AnalysisOptions::default());
        let state = State::new("_", "alice", "_", "/");
        let edges = &a.trans_map[&state];
        assert!(edges.iter().any(|(l, _)| matches!(l, Label::SetUid(_))));

        let stripped = "\
role alice u
subject /
\t/ r
\t-CAP_ALL
";
        let a = Analysis::from_policy_text(stripped, AnalysisOptions::default()).unwrap();
        let state = State::new("_", "alice", "_", "/");
        let edges = &a.trans_map[&state];
        assert!(!edges.iter().any(|(l, _)| matches!(l, Label::SetUid(_))));
        assert!(!edges.iter().any(|(l, _)| matches!(l, Label::SetGid(_))));
    }

    #[test]
    fn test_empty_policy() {
        let a = Analysis::from_policy_text("", AnalysisOptions::default()).unwrap();
        assert!(a.states.is_empty());
        assert!(a.trans_map.is_empty());
    }

    #[test]
    fn test_format_state() {
        let a = analysis(AnalysisOptions::default());
        let state = State::new("_", "alice", "_", "/usr/bin/vi");
        assert_eq!(a.format_state(&state), "alice:U:/usr/bin/vi");
        let state = State::new("_", "_", "_", "/");
        assert_eq!(a.format_state(&state), "default:D:/");
    }
}
