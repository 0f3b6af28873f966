//! Policy preprocessor.
//!
//! Expands `include` directives, `replace` rules and `define` blocks, strips
//! comments and braces, and rewrites the few keywords that collide with
//! identifier tokens, producing a single buffer ready for the lexer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref INCLUDE_REGEX: Regex = Regex::new(r"^\s*include\s+(\S+)\s*$").unwrap();
    static ref REPLACE_REGEX: Regex = Regex::new(r"^\s*replace\s+(\S+)\s+(.*)$").unwrap();
    static ref DEFINE_REGEX: Regex = Regex::new(r"^\s*define\s+(\w+)\s*(.*)$").unwrap();
    static ref RESERVED_REGEX: Regex = Regex::new(r"^(\s*)(connect|bind)\b").unwrap();
    static ref ROLE_ALLOW_IP_REGEX: Regex = Regex::new(r"^\s*role_allow_ip\b").unwrap();
}

// Keep a lid on include recursion; policies in the wild nest two or three
// levels deep at most.
const MAX_INCLUDE_DEPTH: usize = 32;

/// Expand a policy file (or policy directory) into one analyzable buffer.
pub fn expand_policy(path: &Path) -> Result<String, Error> {
    let base = if path.is_dir() {
        path.to_owned()
    } else {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
            _ => PathBuf::from("."),
        }
    };
    let text = read_with_includes(path, &base, 0)?;
    expand_str(&text)
}

/// Apply every preprocessing step except include resolution to an in-memory
/// policy buffer.
pub fn expand_str(text: &str) -> Result<String, Error> {
    let text = strip_comments(text);
    let text = apply_replace_rules(&text);
    let text = apply_defines(&text)?;
    let text = text.replace(['{', '}'], "");
    Ok(rewrite_lines(&text))
}

fn read_with_includes(path: &Path, base: &Path, depth: usize) -> Result<String, Error> {
    if depth > MAX_INCLUDE_DEPTH {
        bail!("include nesting deeper than {} levels at {:?}", MAX_INCLUDE_DEPTH, path);
    }

    if path.is_dir() {
        let mut entries = Vec::new();
        let dir = fs::read_dir(path)
            .map_err(|err| format_err!("unable to read policy directory {:?} - {}", path, err))?;
        for entry in dir {
            let entry =
                entry.map_err(|err| format_err!("unable to read policy directory {:?} - {}", path, err))?;
            entries.push(entry.path());
        }
        // sorted for reproducible preprocessing
        entries.sort();

        let mut text = String::new();
        for entry in entries {
            text.push_str(&read_with_includes(&entry, base, depth + 1)?);
        }
        return Ok(text);
    }

    let raw = fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read policy file {:?} - {}", path, err))?;

    let mut text = String::new();
    for line in raw.lines() {
        if let Some(caps) = INCLUDE_REGEX.captures(line) {
            let target = resolve_include(&caps[1], base);
            text.push_str(&read_with_includes(&target, base, depth + 1)?);
        } else {
            text.push_str(line);
            text.push('\n');
        }
    }

    Ok(text)
}

fn resolve_include(target: &str, base: &Path) -> PathBuf {
    // gradm style includes wrap the target in angle brackets
    let target = target
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .unwrap_or(target);

    if let Some(rest) = target.strip_prefix("/etc/grsec") {
        return base.join(rest.trim_start_matches('/'));
    }
    if target.starts_with('/') {
        return PathBuf::from(target);
    }
    base.join(target)
}

fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        match line.find('#') {
            Some(pos) => out.push_str(&line[..pos]),
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

fn apply_replace_rules(text: &str) -> String {
    let mut rules = Vec::new();
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        if let Some(caps) = REPLACE_REGEX.captures(line) {
            rules.push((caps[1].to_string(), caps[2].trim().to_string()));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    for (name, value) in rules {
        out = out.replace(&format!("$({})", name), &value);
    }
    out
}

struct DefineCapture {
    body: String,
    depth: usize,
    opened: bool,
    done: bool,
}

impl DefineCapture {
    fn new() -> Self {
        Self {
            body: String::new(),
            depth: 0,
            opened: false,
            done: false,
        }
    }

    fn consume(&mut self, chunk: &str) {
        for c in chunk.chars() {
            match c {
                '{' => {
                    self.depth += 1;
                    self.opened = true;
                    if self.depth > 1 {
                        self.body.push(c);
                    }
                }
                '}' => {
                    if self.depth == 0 {
                        continue;
                    }
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.done = true;
                        return;
                    }
                    self.body.push(c);
                }
                c => {
                    if self.opened {
                        self.body.push(c);
                    }
                }
            }
        }
        if self.opened {
            self.body.push('\n');
        }
    }
}

fn apply_defines(text: &str) -> Result<String, Error> {
    let mut defines: Vec<(String, String)> = Vec::new();
    let mut out = String::with_capacity(text.len());

    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let caps = match DEFINE_REGEX.captures(line) {
            Some(caps) => caps,
            None => {
                out.push_str(line);
                out.push('\n');
                continue;
            }
        };

        let name = caps[1].to_string();
        let mut capture = DefineCapture::new();
        capture.consume(&caps[2]);
        while !capture.done {
            match lines.next() {
                Some(line) => capture.consume(line),
                None => bail!("unterminated define block '{}'", name),
            }
        }
        defines.push((name, capture.body));
    }

    // longest name first, so $NAME does not clobber $NAMELONGER
    defines.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    for (name, body) in defines {
        out = out.replace(&format!("${}", name), &body);
    }
    Ok(out)
}

fn rewrite_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if ROLE_ALLOW_IP_REGEX.is_match(line) {
            continue;
        }
        let line = RESERVED_REGEX.replace(line, "${1}${2}_reserved");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_comments_and_braces() -> Result<(), Error> {
        let out = expand_str("role admin sA # administrator\nsubject / {\n\t/ r\n}\n")?;
        assert_eq!(out, "role admin sA \nsubject / \n\t/ r\n\n");
        Ok(())
    }

    #[test]
    fn test_replace_rules() -> Result<(), Error> {
        let out = expand_str("replace HOME /home/alice\nsubject $(HOME)/bin\n")?;
        assert_eq!(out, "subject /home/alice/bin\n");
        Ok(())
    }

    #[test]
    fn test_define_blocks() -> Result<(), Error> {
        let out = expand_str(
            "define denied {\n/boot h\n/dev/grsec h\n}\nsubject /\n$denied\n",
        )?;
        assert!(out.contains("/boot h\n"));
        assert!(out.contains("/dev/grsec h\n"));
        assert!(!out.contains("define"));
        assert!(!out.contains('$'));
        Ok(())
    }

    #[test]
    fn test_define_longest_name_first() -> Result<(), Error> {
        let out = expand_str(
            "define x { /a r }\ndefine xy { /b r }\nsubject /\n$xy\n$x\n",
        )?;
        assert!(out.contains("/b r"));
        assert!(out.contains("/a r"));
        assert!(!out.contains("$x"));
        Ok(())
    }

    #[test]
    fn test_unterminated_define() {
        assert!(expand_str("define broken {\n/a r\n").is_err());
    }

    #[test]
    fn test_reserved_words_and_ip_rules() -> Result<(), Error> {
        let out = expand_str(
            "connect 192.168.0.1:22 stream tcp\nbind disabled\nrole_allow_ip 10.0.0.1\nrole bind u\n",
        )?;
        assert!(out.contains("connect_reserved 192.168.0.1:22 stream tcp\n"));
        assert!(out.contains("bind_reserved disabled\n"));
        assert!(!out.contains("role_allow_ip"));
        // only lines *beginning* with the keyword are rewritten
        assert!(out.contains("role bind u\n"));
        Ok(())
    }

    #[test]
    fn test_include_resolution() -> Result<(), Error> {
        let dir = std::env::temp_dir().join(format!("grflow-test-{}", std::process::id()));
        fs::create_dir_all(dir.join("policy.d"))?;
        fs::write(dir.join("policy"), "role admin sA\ninclude </etc/grsec/policy.d>\n")?;
        fs::write(dir.join("policy.d/10-user"), "role alice u\n")?;
        fs::write(dir.join("policy.d/20-user"), "role bob u\n")?;

        let out = expand_policy(&dir.join("policy"))?;
        let expected_order = ["role admin sA", "role alice u", "role bob u"];
        let positions: Vec<usize> = expected_order
            .iter()
            .map(|needle| out.find(needle).unwrap())
            .collect();
        assert!(positions[0] < positions[1] && positions[1] < positions[2]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn test_missing_include_is_fatal() {
        let dir = std::env::temp_dir().join(format!("grflow-test-missing-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("policy"), "include <nonexistent>\n").unwrap();
        assert!(expand_policy(&dir.join("policy")).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
