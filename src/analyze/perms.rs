//! Permission and capability tables.
//!
//! Builds the per-(role, subject, object) permission map and per-(role,
//! subject) capability and transition tables from the expanded roles, then
//! closes them under longest-prefix inheritance.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Error};
use bitflags::bitflags;
use log::debug;

use crate::policy::{CapDelta, Role, RoleKind, TransPolicy, DONTCARE};

use super::pathmatch::PatternCache;

bitflags! {
    /// Object permission flags parsed from a policy permission string.
    pub struct PermSet: u8 {
        const READ   = 0x01;
        const WRITE  = 0x02;
        const APPEND = 0x04;
        const CREATE = 0x08;
        const EXEC   = 0x10;
        const DELETE = 0x20;
        /// Hidden: suppresses read/write/exec regardless of other flags.
        const HIDDEN = 0x40;
    }
}

impl PermSet {
    /// Parse a permission string; letters outside the tracked alphabet are
    /// ignored.
    pub fn parse(text: &str) -> Self {
        let mut set = PermSet::empty();
        for c in text.chars() {
            match c {
                'r' => set |= PermSet::READ,
                'w' => set |= PermSet::WRITE,
                'a' => set |= PermSet::APPEND,
                'c' => set |= PermSet::CREATE,
                'x' => set |= PermSet::EXEC,
                'd' => set |= PermSet::DELETE,
                'h' => set |= PermSet::HIDDEN,
                _ => {}
            }
        }
        set
    }

    pub fn readable(self) -> bool {
        self.contains(PermSet::READ) && !self.contains(PermSet::HIDDEN)
    }

    pub fn writable(self) -> bool {
        self.intersects(PermSet::WRITE | PermSet::APPEND | PermSet::CREATE)
            && !self.contains(PermSet::HIDDEN)
    }

    pub fn executable(self) -> bool {
        self.contains(PermSet::EXEC) && !self.contains(PermSet::HIDDEN)
    }
}

/// The access modes the flow analysers reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Exec,
}

impl AccessMode {
    pub fn allows(self, perm: PermSet) -> bool {
        match self {
            AccessMode::Read => perm.readable(),
            AccessMode::Write => perm.writable(),
            AccessMode::Exec => perm.executable(),
        }
    }
}

bitflags! {
    /// The semantically tracked capability universe.
    pub struct CapSet: u8 {
        const SETUID = 0x01;
        const SETGID = 0x02;
    }
}

/// Effective capability set of a delta list: the tracked universe, with the
/// deltas applied in declaration order. Untracked capabilities are ignored.
pub fn cap_compute(deltas: &[CapDelta]) -> CapSet {
    let mut set = CapSet::all();
    for delta in deltas {
        let bits = match delta.name.as_str() {
            "CAP_ALL" => CapSet::all(),
            "CAP_SETUID" => CapSet::SETUID,
            "CAP_SETGID" => CapSet::SETGID,
            _ => CapSet::empty(),
        };
        if delta.add {
            set.insert(bits);
        } else {
            set.remove(bits);
        }
    }
    set
}

/// The frozen permission and transition tables of a policy.
#[derive(Default)]
pub struct PermTables {
    /// `(role, subject, object)` to permission flags.
    pub perms: HashMap<(String, String, String), PermSet>,
    /// `(role, subject)` to the object paths declared (or inherited) there.
    pub role_subject_objects: HashMap<(String, String), BTreeSet<String>>,
    /// role to subject path to subject mode string.
    pub role_subjects: BTreeMap<String, BTreeMap<String, String>>,
    /// `(role, subject)` to effective capabilities (after inheritance).
    pub caps: HashMap<(String, String), CapSet>,
    /// `(role, subject)` to allowed user transition targets (incl. `_`).
    pub user_trans: HashMap<(String, String), BTreeSet<String>>,
    /// `(role, subject)` to allowed group transition targets (incl. `_`).
    pub grp_trans: HashMap<(String, String), BTreeSet<String>>,
}

impl PermTables {
    pub fn perm(&self, role: &str, subject: &str, object: &str) -> Option<PermSet> {
        self.perms
            .get(&(role.to_string(), subject.to_string(), object.to_string()))
            .copied()
    }

    /// Object paths visible from `(role, subject)`; empty if the subject
    /// carries no objects.
    pub fn objects(&self, role: &str, subject: &str) -> Option<&BTreeSet<String>> {
        self.role_subject_objects
            .get(&(role.to_string(), subject.to_string()))
    }
}

/// Resolve a subject transition policy against the set of roles of the
/// matching kind.
fn resolve_policy(policy: &TransPolicy, kind_roles: &BTreeSet<String>) -> BTreeSet<String> {
    match policy {
        TransPolicy::Unspecified => {
            let mut set = kind_roles.clone();
            set.insert(DONTCARE.to_string());
            set
        }
        TransPolicy::Allow(names) => {
            let mut set = BTreeSet::new();
            let mut foreign = false;
            for name in names {
                if kind_roles.contains(name) {
                    set.insert(name.clone());
                } else {
                    foreign = true;
                }
            }
            // naming a non-role target permits dropping to "no role"
            if foreign {
                set.insert(DONTCARE.to_string());
            }
            set
        }
        TransPolicy::Deny(names) => {
            let mut set = kind_roles.clone();
            set.insert(DONTCARE.to_string());
            for name in names {
                set.remove(name);
            }
            set
        }
    }
}

/// Build the raw tables and close them under inheritance.
pub fn build_tables(roles: &[Role], cache: &mut PatternCache) -> Result<PermTables, Error> {
    let mut tables = PermTables::default();

    let user_roles: BTreeSet<String> = roles
        .iter()
        .filter(|r| r.kind == RoleKind::User)
        .map(|r| r.name.clone())
        .collect();
    let group_roles: BTreeSet<String> = roles
        .iter()
        .filter(|r| r.kind == RoleKind::Group)
        .map(|r| r.name.clone())
        .collect();

    // raw tables straight from the declarations
    let mut deltas: HashMap<(String, String), Vec<CapDelta>> = HashMap::new();
    for role in roles {
        let subjects = tables.role_subjects.entry(role.name.clone()).or_default();
        for subject in &role.subjects {
            if subjects
                .insert(subject.path.clone(), subject.mode.clone())
                .is_some()
            {
                bail!(
                    "duplicate subject path '{}' in role '{}'",
                    subject.path,
                    role.name
                );
            }
            cache.intern(&subject.path)?;

            let key = (role.name.clone(), subject.path.clone());
            deltas.insert(key.clone(), subject.caps.clone());
            tables
                .user_trans
                .insert(key.clone(), resolve_policy(&subject.user_trans, &user_roles));
            tables
                .grp_trans
                .insert(key.clone(), resolve_policy(&subject.group_trans, &group_roles));

            for object in &subject.objects {
                cache.intern(&object.path)?;
                let perm = PermSet::parse(&object.perm);
                tables.perms.insert(
                    (role.name.clone(), subject.path.clone(), object.path.clone()),
                    perm,
                );
                tables
                    .role_subject_objects
                    .entry(key.clone())
                    .or_default()
                    .insert(object.path.clone());
            }
        }
    }

    for role in roles {
        inherit_role(&mut tables, &deltas, &role.name, cache);
    }

    Ok(tables)
}

/// Longest-prefix inheritance inside one role.
///
/// Subjects without the `o` flag take the capability delta list and any
/// permission entries they do not declare themselves from their greatest
/// matching declared sibling. Processing in ascending path length order makes
/// chains compose transitively; override subjects still serve as parents.
fn inherit_role(
    tables: &mut PermTables,
    deltas: &HashMap<(String, String), Vec<CapDelta>>,
    role: &str,
    cache: &PatternCache,
) {
    let subjects: Vec<(String, String)> = match tables.role_subjects.get(role) {
        Some(map) => map.iter().map(|(p, m)| (p.clone(), m.clone())).collect(),
        None => return,
    };
    let all_paths: Vec<String> = subjects.iter().map(|(p, _)| p.clone()).collect();

    let mut eff_deltas: HashMap<String, Vec<CapDelta>> = HashMap::new();
    for (path, _) in &subjects {
        let own = deltas
            .get(&(role.to_string(), path.clone()))
            .cloned()
            .unwrap_or_default();
        eff_deltas.insert(path.clone(), own);
    }

    let mut inherit: Vec<&(String, String)> = subjects
        .iter()
        .filter(|(_, mode)| !mode.contains('o'))
        .collect();
    inherit.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

    for (path, _) in inherit {
        let parent = {
            let others = all_paths.iter().filter(|p| *p != path);
            match cache.gmp(others, path) {
                Some(parent) => parent.to_string(),
                None => continue,
            }
        };
        debug!("role '{}': subject '{}' inherits from '{}'", role, path, parent);

        // capability deltas: parent's effective list first, own appended
        let parent_deltas = eff_deltas.get(&parent).cloned().unwrap_or_default();
        if let Some(own) = eff_deltas.get_mut(path) {
            let mut merged = parent_deltas;
            merged.append(own);
            *own = merged;
        }

        // permissions: parent entries the child does not declare itself
        let parent_objects: Vec<String> = tables
            .objects(role, &parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for object in parent_objects {
            let child_key = (role.to_string(), path.clone(), object.clone());
            if tables.perms.contains_key(&child_key) {
                continue;
            }
            if let Some(perm) = tables.perm(role, &parent, &object) {
                tables.perms.insert(child_key, perm);
                tables
                    .role_subject_objects
                    .entry((role.to_string(), path.clone()))
                    .or_default()
                    .insert(object);
            }
        }
    }

    for (path, _) in &subjects {
        let caps = cap_compute(eff_deltas.get(path).map(Vec::as_slice).unwrap_or(&[]));
        tables.caps.insert((role.to_string(), path.clone()), caps);
    }
}
