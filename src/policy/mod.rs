//! Policy language frontend: preprocessing, lexing, parsing and domain
//! expansion of grsecurity RBAC policies.

use std::collections::HashSet;

use anyhow::{bail, Error};

pub mod lexer;
pub mod parser;
pub mod preprocess;

/// Sentinel role name meaning "any role or none".
pub const DONTCARE: &str = "_";

/// Role kind as declared by the `s`/`u`/`g` mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Special,
    User,
    Group,
    Default,
}

impl RoleKind {
    /// Upper-case kind letter used when rendering states.
    pub fn letter(self) -> char {
        match self {
            RoleKind::Special => 'S',
            RoleKind::User => 'U',
            RoleKind::Group => 'G',
            RoleKind::Default => 'D',
        }
    }
}

/// Per-subject user/group transition policy.
///
/// Later `*_transition_allow`/`*_transition_deny` clauses on the same subject
/// replace earlier ones (the parser warns when that happens).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransPolicy {
    Unspecified,
    Allow(Vec<String>),
    Deny(Vec<String>),
}

impl Default for TransPolicy {
    fn default() -> Self {
        TransPolicy::Unspecified
    }
}

/// A single `+CAP_X` / `-CAP_X` capability delta, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapDelta {
    pub add: bool,
    pub name: String,
}

/// An object declaration inside a subject block.
#[derive(Debug, Clone)]
pub struct ObjectDecl {
    pub path: String,
    /// Raw permission string (`r`, `w`, `a`, `c`, `x`, `d`, `h`, …); may be
    /// empty when the policy declares a bare path.
    pub perm: String,
}

/// A subject block inside a role declaration.
#[derive(Debug, Clone, Default)]
pub struct SubjectDecl {
    pub path: String,
    /// Subject mode flags; `o` disables permission inheritance.
    pub mode: String,
    pub user_trans: TransPolicy,
    pub group_trans: TransPolicy,
    pub caps: Vec<CapDelta>,
    pub objects: Vec<ObjectDecl>,
}

impl SubjectDecl {
    pub fn overrides_inheritance(&self) -> bool {
        self.mode.contains('o')
    }
}

/// Head of a role declaration: a plain role name, or the user set bound by a
/// `domain` declaration (the domain name itself only matters for diagnostics).
#[derive(Debug, Clone)]
pub enum RoleHead {
    Name(String),
    UserSet(Vec<String>),
}

/// One parsed `role` or `domain` declaration.
#[derive(Debug, Clone)]
pub struct RoleDecl {
    pub head: RoleHead,
    pub mode: String,
    pub transitions: Vec<String>,
    pub subjects: Vec<SubjectDecl>,
}

/// A role after domain expansion.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub kind: RoleKind,
    /// Administrative (`A` flag) roles are blacklisted unless the operator
    /// opts in.
    pub admin: bool,
    pub transitions: Vec<String>,
    pub subjects: Vec<SubjectDecl>,
}

fn kind_from_mode(name: &str, mode: &str) -> Result<RoleKind, Error> {
    if name == "default" {
        return Ok(RoleKind::Default);
    }
    let mut kind = None;
    for flag in mode.chars() {
        let next = match flag {
            's' => RoleKind::Special,
            'u' => RoleKind::User,
            'g' => RoleKind::Group,
            _ => continue,
        };
        if kind.is_some() {
            bail!("role '{}' declares more than one kind flag in mode '{}'", name, mode);
        }
        kind = Some(next);
    }
    match kind {
        Some(kind) => Ok(kind),
        None => bail!("role '{}' declares no kind flag (expected one of 's', 'u', 'g')", name),
    }
}

/// Expand `domain` declarations into one role per bound user and validate
/// role kinds. Duplicate role names after expansion are rejected.
pub fn expand_domains(decls: Vec<RoleDecl>) -> Result<Vec<Role>, Error> {
    let mut roles = Vec::new();
    let mut seen = HashSet::new();

    for decl in decls {
        let admin = decl.mode.contains('A');
        let names = match decl.head {
            RoleHead::Name(name) => vec![name],
            RoleHead::UserSet(users) => users,
        };
        for name in names {
            let kind = kind_from_mode(&name, &decl.mode)?;
            if !seen.insert(name.clone()) {
                bail!("duplicate role '{}' after domain expansion", name);
            }
            roles.push(Role {
                name,
                kind,
                admin,
                transitions: decl.transitions.clone(),
                subjects: decl.subjects.clone(),
            });
        }
    }

    Ok(roles)
}

#[cfg(test)]
mod test {
    use super::*;

    fn decl(head: RoleHead, mode: &str) -> RoleDecl {
        RoleDecl {
            head,
            mode: mode.to_string(),
            transitions: vec!["admin".to_string()],
            subjects: Vec::new(),
        }
    }

    #[test]
    fn test_domain_expansion() -> Result<(), Error> {
        let roles = expand_domains(vec![
            decl(RoleHead::Name("admin".to_string()), "sA"),
            decl(
                RoleHead::UserSet(vec!["alice".to_string(), "bob".to_string()]),
                "u",
            ),
        ])?;

        let names: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["admin", "alice", "bob"]);
        assert_eq!(roles[0].kind, RoleKind::Special);
        assert!(roles[0].admin);
        assert_eq!(roles[1].kind, RoleKind::User);
        assert_eq!(roles[1].transitions, ["admin"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_roles_rejected() {
        let result = expand_domains(vec![
            decl(RoleHead::Name("alice".to_string()), "u"),
            decl(RoleHead::UserSet(vec!["alice".to_string()]), "u"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_role_kind_validation() {
        assert!(kind_from_mode("r1", "ug").is_err());
        assert!(kind_from_mode("r1", "A").is_err());
        assert_eq!(kind_from_mode("default", "").unwrap(), RoleKind::Default);
        assert_eq!(kind_from_mode("r1", "gN").unwrap(), RoleKind::Group);
    }
}
