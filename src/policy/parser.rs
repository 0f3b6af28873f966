//! Parser producing role declarations from preprocessed policy text.

use std::iter::Peekable;

use anyhow::{bail, Error};
use log::{debug, warn};

use super::lexer::{Lexer, Token};
use super::{CapDelta, ObjectDecl, RoleDecl, RoleHead, SubjectDecl, TransPolicy};

pub struct PolicyParser<'a> {
    input: Peekable<Lexer<'a>>,
    line_nr: usize,
}

impl<'a> PolicyParser<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            input: Lexer::new(text).peekable(),
            line_nr: 1,
        }
    }

    fn peek(&mut self) -> Token {
        match self.input.peek() {
            Some((token, _)) => *token,
            None => Token::Eof,
        }
    }

    fn next(&mut self) -> (Token, String) {
        match self.input.next() {
            Some((token, text)) => {
                if token == Token::Newline {
                    self.line_nr += 1;
                }
                (token, text)
            }
            None => (Token::Eof, String::new()),
        }
    }

    fn eat(&mut self, expected: Token) -> Result<(), Error> {
        let (next, text) = self.next();
        if next != expected {
            bail!(
                "expected {:?}, got {:?} '{}' (line {})",
                expected,
                next,
                text,
                self.line_nr
            );
        }
        Ok(())
    }

    fn skip_newlines(&mut self) {
        while self.peek() == Token::Newline {
            self.next();
        }
    }

    fn skip_to_eol(&mut self) {
        loop {
            match self.peek() {
                Token::Newline => {
                    self.next();
                    return;
                }
                Token::Eof => return,
                _ => {
                    self.next();
                }
            }
        }
    }

    /// Collect the text of every remaining token on the current line.
    fn words_to_eol(&mut self) -> Vec<String> {
        let mut words = Vec::new();
        loop {
            match self.peek() {
                Token::Newline => {
                    self.next();
                    return words;
                }
                Token::Eof => return words,
                _ => words.push(self.next().1),
            }
        }
    }

    /// Parse the whole buffer into a list of role declarations.
    pub fn parse(mut self) -> Result<Vec<RoleDecl>, Error> {
        let mut roles = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Token::Role => roles.push(self.parse_role()?),
                Token::Domain => roles.push(self.parse_domain()?),
                Token::Eof => return Ok(roles),
                other => {
                    let (_, text) = self.next();
                    bail!(
                        "expected role or domain declaration, got {:?} '{}' (line {})",
                        other,
                        text,
                        self.line_nr
                    );
                }
            }
        }
    }

    fn parse_role(&mut self) -> Result<RoleDecl, Error> {
        self.eat(Token::Role)?;
        let (token, name) = self.next();
        if token == Token::Newline || token == Token::Eof {
            bail!("role declaration without a name (line {})", self.line_nr);
        }
        let mode = match self.peek() {
            Token::Newline | Token::Eof => String::new(),
            _ => self.next().1,
        };
        if self.peek() == Token::Newline {
            self.next();
        }

        let (transitions, subjects) = self.parse_role_tail(&name)?;
        Ok(RoleDecl {
            head: RoleHead::Name(name),
            mode,
            transitions,
            subjects,
        })
    }

    fn parse_domain(&mut self) -> Result<RoleDecl, Error> {
        self.eat(Token::Domain)?;
        let (token, name) = self.next();
        if token == Token::Newline || token == Token::Eof {
            bail!("domain declaration without a name (line {})", self.line_nr);
        }
        let (token, mode) = self.next();
        if token == Token::Newline || token == Token::Eof {
            bail!("domain '{}' without a kind flag (line {})", name, self.line_nr);
        }
        let users = self.words_to_eol();
        if users.is_empty() {
            bail!("domain '{}' binds no users (line {})", name, self.line_nr);
        }
        debug!("domain '{}' binds users {:?}", name, users);

        let (transitions, subjects) = self.parse_role_tail(&name)?;
        Ok(RoleDecl {
            head: RoleHead::UserSet(users),
            mode,
            transitions,
            subjects,
        })
    }

    fn parse_role_tail(
        &mut self,
        role: &str,
    ) -> Result<(Vec<String>, Vec<SubjectDecl>), Error> {
        let mut transitions = Vec::new();
        let mut subjects = Vec::new();

        loop {
            self.skip_newlines();
            match self.peek() {
                Token::RoleTransitions => {
                    self.next();
                    transitions.extend(self.words_to_eol());
                }
                Token::Subject => subjects.push(self.parse_subject(role)?),
                // role level ip rules are parsed and discarded
                Token::IpOverride => {
                    self.next();
                    debug!("discarding ip_override in role '{}'", role);
                    self.skip_to_eol();
                }
                Token::Role | Token::Domain | Token::Eof => {
                    return Ok((transitions, subjects))
                }
                other => {
                    let (_, text) = self.next();
                    bail!(
                        "unexpected {:?} '{}' in role '{}' (line {})",
                        other,
                        text,
                        role,
                        self.line_nr
                    );
                }
            }
        }
    }

    fn parse_subject(&mut self, role: &str) -> Result<SubjectDecl, Error> {
        self.eat(Token::Subject)?;
        let (token, path) = self.next();
        if path.contains(':') {
            bail!(
                "nested subject paths are not supported: '{}' in role '{}' (line {})",
                path,
                role,
                self.line_nr
            );
        }
        if token != Token::Path {
            bail!(
                "expected subject path, got {:?} '{}' in role '{}' (line {})",
                token,
                path,
                role,
                self.line_nr
            );
        }
        let mode = match self.peek() {
            Token::Ident => self.next().1,
            _ => String::new(),
        };
        if self.peek() == Token::Newline {
            self.next();
        }

        let mut subject = SubjectDecl {
            path,
            mode,
            ..Default::default()
        };

        loop {
            self.skip_newlines();
            match self.peek() {
                Token::Path => {
                    let path = self.next().1;
                    let perm = match self.peek() {
                        Token::Ident => self.next().1,
                        _ => String::new(),
                    };
                    match self.peek() {
                        Token::Newline | Token::Eof => {}
                        other => bail!(
                            "trailing {:?} after object '{}' in role '{}' (line {})",
                            other,
                            path,
                            role,
                            self.line_nr
                        ),
                    }
                    subject.objects.push(ObjectDecl { path, perm });
                }
                Token::CapDelta => {
                    let text = self.next().1;
                    subject.caps.push(CapDelta {
                        add: text.starts_with('+'),
                        name: text[1..].to_string(),
                    });
                }
                Token::UserTransitionAllow => {
                    self.next();
                    let users = self.words_to_eol();
                    update_policy(
                        &mut subject.user_trans,
                        TransPolicy::Allow(users),
                        "user",
                        &subject.path,
                        role,
                    );
                }
                Token::UserTransitionDeny => {
                    self.next();
                    let users = self.words_to_eol();
                    update_policy(
                        &mut subject.user_trans,
                        TransPolicy::Deny(users),
                        "user",
                        &subject.path,
                        role,
                    );
                }
                Token::GroupTransitionAllow => {
                    self.next();
                    let groups = self.words_to_eol();
                    update_policy(
                        &mut subject.group_trans,
                        TransPolicy::Allow(groups),
                        "group",
                        &subject.path,
                        role,
                    );
                }
                Token::GroupTransitionDeny => {
                    self.next();
                    let groups = self.words_to_eol();
                    update_policy(
                        &mut subject.group_trans,
                        TransPolicy::Deny(groups),
                        "group",
                        &subject.path,
                        role,
                    );
                }
                // PaX flags, resource limits and socket/ip ACLs are parsed
                // and discarded
                Token::PaxDelta | Token::Resource => {
                    let text = self.next().1;
                    debug!("discarding '{}' in subject '{}'", text, subject.path);
                    self.skip_to_eol();
                }
                Token::ConnectReserved
                | Token::BindReserved
                | Token::SockAllowFamily
                | Token::IpOverride => {
                    self.next();
                    self.skip_to_eol();
                }
                Token::Subject | Token::Role | Token::Domain | Token::Eof => {
                    return Ok(subject);
                }
                other => {
                    let (_, text) = self.next();
                    bail!(
                        "unexpected {:?} '{}' in subject '{}' of role '{}' (line {})",
                        other,
                        text,
                        subject.path,
                        role,
                        self.line_nr
                    );
                }
            }
        }
    }

}

/// The precedence of conflicting transition clauses is last-wins; warn so
/// strict operators can clean the policy up.
fn update_policy(
    slot: &mut TransPolicy,
    policy: TransPolicy,
    which: &str,
    subject: &str,
    role: &str,
) {
    if *slot != TransPolicy::Unspecified {
        warn!(
            "subject '{}' in role '{}' redefines its {} transition policy, last clause wins",
            subject, role, which
        );
    }
    *slot = policy;
}
