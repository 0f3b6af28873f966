//! Tokeniser for preprocessed policy text.

use std::collections::{HashMap, VecDeque};

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Token {
    Role,
    Domain,
    Subject,
    RoleTransitions,
    UserTransitionAllow,
    UserTransitionDeny,
    GroupTransitionAllow,
    GroupTransitionDeny,
    IpOverride,
    ConnectReserved,
    BindReserved,
    Disabled,
    SockAllowFamily,
    /// `+CAP_X` / `-CAP_X`
    CapDelta,
    /// `+PAX_X` / `-PAX_X`
    PaxDelta,
    /// `RES_X`
    Resource,
    /// numeric limit with optional unit suffix
    Number,
    /// dotted IPv4, optionally with `/mask` and `:port[-port]`
    IpAddr,
    /// bare `:port[-port]`
    Port,
    /// absolute path, possibly with glob wildcards
    Path,
    /// fallback: role/user names, mode strings, permission strings
    Ident,
    Newline,
    Eof,
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, Token> = {
        let mut map = HashMap::new();
        map.insert("role", Token::Role);
        map.insert("domain", Token::Domain);
        map.insert("subject", Token::Subject);
        map.insert("role_transitions", Token::RoleTransitions);
        map.insert("user_transition_allow", Token::UserTransitionAllow);
        map.insert("user_transition_deny", Token::UserTransitionDeny);
        map.insert("group_transition_allow", Token::GroupTransitionAllow);
        map.insert("group_transition_deny", Token::GroupTransitionDeny);
        map.insert("ip_override", Token::IpOverride);
        map.insert("connect_reserved", Token::ConnectReserved);
        map.insert("bind_reserved", Token::BindReserved);
        map.insert("disabled", Token::Disabled);
        map.insert("sock_allow_family", Token::SockAllowFamily);
        map
    };
    static ref CAP_REGEX: Regex = Regex::new(r"^[+-]CAP_[A-Z0-9_]+$").unwrap();
    static ref PAX_REGEX: Regex = Regex::new(r"^[+-]PAX_[A-Z0-9_]+$").unwrap();
    static ref RES_REGEX: Regex = Regex::new(r"^RES_[A-Z0-9_]+$").unwrap();
    static ref NUMBER_REGEX: Regex = Regex::new(r"^\d+[kKmMgGtT]?$").unwrap();
    static ref IP_REGEX: Regex =
        Regex::new(r"^\d{1,3}(\.\d{1,3}){3}(/\d{1,2})?(:\d+(-\d+)?)?$").unwrap();
    static ref PORT_REGEX: Regex = Regex::new(r"^:\d+(-\d+)?$").unwrap();
    static ref PATH_REGEX: Regex = Regex::new(r"^/[\w.*?+\[\]/-]*$").unwrap();
}

pub struct Lexer<'a> {
    lines: std::str::Lines<'a>,
    cur_line: Option<VecDeque<(Token, String)>>,
    eof_sent: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lines: input.lines(),
            cur_line: None,
            eof_sent: false,
        }
    }

    fn classify(word: &str) -> Token {
        if let Some(token) = KEYWORDS.get(word) {
            return *token;
        }
        if CAP_REGEX.is_match(word) {
            return Token::CapDelta;
        }
        if PAX_REGEX.is_match(word) {
            return Token::PaxDelta;
        }
        if RES_REGEX.is_match(word) {
            return Token::Resource;
        }
        if NUMBER_REGEX.is_match(word) {
            return Token::Number;
        }
        if IP_REGEX.is_match(word) {
            return Token::IpAddr;
        }
        if PORT_REGEX.is_match(word) {
            return Token::Port;
        }
        if PATH_REGEX.is_match(word) {
            return Token::Path;
        }
        Token::Ident
    }

    fn split_line(line: &str) -> VecDeque<(Token, String)> {
        line.split_ascii_whitespace()
            .map(|word| (Self::classify(word), word.to_string()))
            .collect()
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = (Token, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cur_line.is_none() {
                match self.lines.next() {
                    Some(line) => self.cur_line = Some(Self::split_line(line)),
                    None => {
                        if self.eof_sent {
                            return None;
                        }
                        self.eof_sent = true;
                        return Some((Token::Eof, String::new()));
                    }
                }
            }

            match self.cur_line {
                Some(ref mut cur_line) => {
                    if cur_line.is_empty() {
                        self.cur_line = None;
                        return Some((Token::Newline, String::from("\n")));
                    }
                    if let Some(item) = cur_line.pop_front() {
                        return Some(item);
                    }
                }
                None => continue,
            }
        }
    }
}
