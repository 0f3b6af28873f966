//! Component-wise glob matching on filesystem paths.
//!
//! A declared path matches a concrete path if it has at most as many `/`
//! separated components and every component shell-matches (`*`, `?`,
//! `[...]`) the corresponding component of the concrete path. This is a
//! prefix match, not a full shell match: `/usr` matches `/usr/bin/sh`.
//!
//! Edge cases: `/` is treated as the single empty component and therefore
//! matches every absolute path; a trailing `/` adds an empty component which
//! only matches another empty component in the same position.

use std::collections::HashMap;

use anyhow::{format_err, Error};
use regex::Regex;

enum Component {
    Literal(String),
    Pattern(Regex),
}

impl Component {
    fn matches(&self, component: &str) -> bool {
        match self {
            Component::Literal(text) => text == component,
            Component::Pattern(regex) => regex.is_match(component),
        }
    }
}

/// A declared subject or object path, compiled for repeated matching.
pub struct PathPattern {
    raw: String,
    components: Vec<Component>,
}

/// Split a path on `/`, treating `/` itself as the single empty component.
pub fn split_components(path: &str) -> Vec<&str> {
    if path == "/" {
        return vec![""];
    }
    path.split('/').collect()
}

impl PathPattern {
    pub fn new(path: &str) -> Result<Self, Error> {
        let components = split_components(path)
            .into_iter()
            .map(compile_component)
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            raw: path.to_string(),
            components,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Component-wise prefix match against a concrete path.
    pub fn matches(&self, path: &str) -> bool {
        let components = split_components(path);
        if self.components.len() > components.len() {
            return false;
        }
        self.components
            .iter()
            .zip(components)
            .all(|(pattern, component)| pattern.matches(component))
    }
}

fn compile_component(component: &str) -> Result<Component, Error> {
    if !component.contains(['*', '?', '[']) {
        return Ok(Component::Literal(component.to_string()));
    }

    let mut regex = String::with_capacity(component.len() + 8);
    regex.push('^');
    let mut chars = component.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => {
                // character class, copied through; `[!...]` negates
                regex.push('[');
                if let Some('!') = chars.peek() {
                    chars.next();
                    regex.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' {
                        regex.push('\\');
                    }
                    regex.push(c);
                }
                if !closed {
                    return Err(format_err!(
                        "unterminated character class in path component '{}'",
                        component
                    ));
                }
                regex.push(']');
            }
            c if "\\.+()|^$#&-~{}]".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');

    let regex = Regex::new(&regex)
        .map_err(|err| format_err!("invalid glob component '{}' - {}", component, err))?;
    Ok(Component::Pattern(regex))
}

/// Compiled patterns for every declared path, interned once at build time.
#[derive(Default)]
pub struct PatternCache {
    map: HashMap<String, PathPattern>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, path: &str) -> Result<(), Error> {
        if !self.map.contains_key(path) {
            let pattern = PathPattern::new(path)?;
            self.map.insert(path.to_string(), pattern);
        }
        Ok(())
    }

    /// Whether the declared path `pattern` component-wise prefix-matches
    /// `path`. Unknown patterns never match.
    pub fn matches(&self, pattern: &str, path: &str) -> bool {
        match self.map.get(pattern) {
            Some(pattern) => pattern.matches(path),
            None => false,
        }
    }

    /// Greatest matching path: among the candidate patterns matching `path`,
    /// the one of maximum string length, ties broken lexicographically.
    pub fn gmp<'a, I>(&self, candidates: I, path: &str) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a String>,
    {
        candidates
            .into_iter()
            .filter(|candidate| self.matches(candidate, path))
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .map(|s| s.as_str())
    }
}
