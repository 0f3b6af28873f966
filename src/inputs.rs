//! External input files: entry points, targets and learn-config extraction.

use std::fs;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use crate::analyze::State;
use crate::policy::DONTCARE;

/// Entry-point configuration: plain entry states for the direct and
/// write–execute analyses, and `(s1, s2, target)` triples for the indirect
/// analysis.
#[derive(Default)]
pub struct EntryPoints {
    pub states: Vec<State>,
    pub triples: Vec<(State, State, String)>,
}

/// Parse a `<role>:<TYPE>:<subject>` state specification. `TYPE` places the
/// role name in the special (`S`), user (`U`) or group (`G`) slot; `D`
/// leaves every slot unset.
pub fn parse_state_spec(spec: &str) -> Result<State, Error> {
    let mut parts = spec.splitn(3, ':');
    let (role, ty, subject) = match (parts.next(), parts.next(), parts.next()) {
        (Some(role), Some(ty), Some(subject)) if !subject.is_empty() => (role, ty, subject),
        _ => bail!("malformed state specification '{}' (expected role:TYPE:subject)", spec),
    };

    let (special, user, group) = match ty {
        "S" => (role, DONTCARE, DONTCARE),
        "U" => (DONTCARE, role, DONTCARE),
        "G" => (DONTCARE, DONTCARE, role),
        "D" => (DONTCARE, DONTCARE, DONTCARE),
        other => bail!(
            "unknown state type '{}' in '{}' (expected S, U, G or D)",
            other,
            spec
        ),
    };
    Ok(State::new(special, user, group, subject))
}

/// Parse entry-point records: `<state>` or `<state> <state> <target>` per
/// line.
pub fn parse_entry_points(text: &str) -> Result<EntryPoints, Error> {
    let mut entry_points = EntryPoints::default();

    for line in non_comment_lines(text) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [state] => entry_points.states.push(parse_state_spec(state)?),
            [s1, s2, target] => entry_points.triples.push((
                parse_state_spec(s1)?,
                parse_state_spec(s2)?,
                (*target).to_string(),
            )),
            _ => bail!(
                "malformed entry point record '{}' (expected 1 or 3 fields)",
                line
            ),
        }
    }

    Ok(entry_points)
}

pub fn read_entry_points(path: &Path) -> Result<EntryPoints, Error> {
    let text = fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read entry points file {:?} - {}", path, err))?;
    parse_entry_points(&text)
}

/// Parse a targets file: one path per line.
pub fn parse_targets(text: &str) -> Vec<String> {
    non_comment_lines(text)
        .map(|line| line.trim().to_string())
        .collect()
}

pub fn read_targets(path: &Path) -> Result<Vec<String>, Error> {
    let text = fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read targets file {:?} - {}", path, err))?;
    Ok(parse_targets(&text))
}

/// Extract targets from a learn-config file: every path following a
/// `read-protected-path` or `high-protected-path` keyword.
pub fn parse_learn_config(text: &str) -> Vec<String> {
    let mut targets = Vec::new();
    for line in non_comment_lines(text) {
        let words: Vec<&str> = line.split_whitespace().collect();
        for pair in words.windows(2) {
            if matches!(pair[0], "read-protected-path" | "high-protected-path") {
                targets.push(pair[1].to_string());
            }
        }
    }
    targets
}

pub fn read_learn_config(path: &Path) -> Result<Vec<String>, Error> {
    let text = fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read learn config file {:?} - {}", path, err))?;
    Ok(parse_learn_config(&text))
}

fn non_comment_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}
