//! Splitting command lines into fields the way the rc shell does.
//!
//! [`tokenize`] is an implementation of Plan 9's tokenize(2): the input is
//! split into fields separated by whitespace, single quotes are interpreted
//! and do not appear in the output, and two consecutive quotes inside a
//! quoted part yield one literal quote.
//!
//! [`Tokenizer::parse_cmd_line`] performs the full command-line analysis on
//! top of that: `$var` references are expanded through a caller-supplied
//! lookup, `NAME=VALUE` prefixes are collected into an assignment map, `^`
//! concatenates adjacent fields, `#` starts a comment, and a trailing
//! `<`/`>`/`>>` with a filename becomes a [`Redirection`].

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::env::EnvMap;
use crate::quote::{join_cmd, quote};

lazy_static! {
    static ref ARGREF_RE: Regex = Regex::new("^[1-9][0-9]*$").unwrap();
    static ref ARRIDX_RE: Regex = Regex::new(r"\(([0-9]*)\)$").unwrap();
}

/// Syntax failure while scanning a line. The offending character is carried
/// in the error; nothing about the line is salvaged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token '{0}': syntax error")]
    Syntax(char),
}

/// One node of the token tree built while scanning a command line.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Literal text.
    Str(String),
    /// Concatenation of sub-tokens that fuse into one field after expansion.
    Group(Vec<Token>),
    /// A `$name` reference. `text` keeps the leading `$` (and the `#` of a
    /// count reference) exactly as scanned.
    VarRef { text: String, is_count: bool },
    /// A `name=value` assignment. `value` keeps the leading `=`.
    Assign { name: Box<Token>, value: String },
    /// `<`, `>` or `>>`; the filename is the following field.
    Redir(String),
    /// Expansion of a list-valued variable; flattened away before a
    /// [`CmdLine`] is returned.
    List(Vec<String>),
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Str(s) => s.clone(),
            Token::Group(g) => g.iter().map(Token::text).collect(),
            Token::VarRef { text, .. } => text.clone(),
            Token::Assign { name, value } => name.text() + value,
            Token::Redir(op) => op.clone(),
            Token::List(values) => values.join(" "),
        }
    }

    /// Replace the token's own text. Groups and lists have no text of their
    /// own and ignore this.
    fn set_text(&mut self, t: &str) {
        match self {
            Token::Str(s) => *s = t.to_string(),
            Token::VarRef { text, .. } => *text = t.to_string(),
            Token::Assign { value, .. } => *value = t.to_string(),
            Token::Redir(op) => *op = t.to_string(),
            Token::Group(_) | Token::List(_) => {}
        }
    }

    fn add_text(&mut self, t: &str) {
        match self {
            Token::Str(s) => s.push_str(t),
            Token::VarRef { text, .. } => text.push_str(t),
            Token::Assign { value, .. } => value.push_str(t),
            _ => {}
        }
    }

    /// Whether a following plain string may be fused into this token.
    fn is_adder(&self) -> bool {
        matches!(
            self,
            Token::Str(_) | Token::VarRef { .. } | Token::Assign { .. }
        )
    }
}

/// The redirection found on a command line. An empty `kind` means none.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub kind: String,
    pub filename: String,
}

/// The result of analyzing one command line: the assignment prefix, the
/// remaining fields, and an optional redirection.
#[derive(Debug, Default, Clone)]
pub struct CmdLine {
    pub assignments: EnvMap,
    pub fields: Vec<String>,
    pub redir: Redirection,
}

impl fmt::Display for CmdLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        let mut names: Vec<&String> = self.assignments.keys().collect();
        names.sort();
        for name in names {
            let value = self.assignments[name].join(" ");
            write!(f, "{}{}={}", sep, name, quote(&value))?;
            sep = " ";
        }
        if !self.fields.is_empty() {
            let cs = join_cmd(&self.fields);
            if !cs.is_empty() {
                write!(f, "{}{}", sep, cs)?;
                sep = " ";
            }
        }
        if !self.redir.kind.is_empty() {
            write!(f, "{}{} {}", sep, self.redir.kind, quote(&self.redir.filename))?;
        }
        Ok(())
    }
}

/// Split `s` into fields with quote processing only: no variable expansion,
/// no assignments, no redirections, no comments.
pub fn tokenize(s: &str) -> Vec<String> {
    match Lexer::new(s, false).run() {
        Ok((tokens, _)) => fields_of(&tokens),
        // Plain field splitting has no failing constructs.
        Err(_) => Vec::new(),
    }
}

/// Command-line analyzer.
///
/// `getenv` supplies variable values during expansion; when it is absent,
/// references stay in the output verbatim.
#[derive(Default)]
pub struct Tokenizer<'a> {
    pub getenv: Option<&'a dyn Fn(&str) -> Vec<String>>,
}

impl Tokenizer<'_> {
    /// Analyze one command line into a [`CmdLine`].
    pub fn parse_cmd_line(&self, s: &str) -> Result<CmdLine, TokenError> {
        let (mut tokens, n_assign) = Lexer::new(s, true).run()?;
        if let Some(getenv) = self.getenv {
            let mut expanded = Vec::with_capacity(tokens.len());
            for t in tokens {
                if let Some(t) = expand_env(getenv, t) {
                    expanded.push(t);
                }
            }
            tokens = expanded;
        }
        let tokens = flatten_string_lists(tokens);

        let mut c = CmdLine {
            assignments: EnvMap::new(),
            fields: fields_of(&tokens),
            redir: redirection_of(&tokens),
        };
        let n_assign = n_assign.min(tokens.len());
        if n_assign != 0 {
            for t in &tokens[..n_assign] {
                let (name, value) = match t {
                    Token::Assign { name, value } => (name.text(), strip_eq(value)),
                    // A list-valued expansion in the value leaves the
                    // assignment wrapped in a group; fold the pieces back
                    // into one string.
                    Token::Group(g) => match g.first() {
                        Some(Token::Assign { name, value }) => {
                            let mut v = strip_eq(value);
                            for sub in &g[1..] {
                                v.push_str(&sub.text());
                            }
                            (name.text(), v)
                        }
                        _ => continue,
                    },
                    _ => continue,
                };
                c.assignments.insert(name, vec![value]);
            }
            c.fields.drain(..n_assign);
        }
        Ok(c)
    }
}

fn strip_eq(value: &str) -> String {
    value.strip_prefix('=').unwrap_or(value).to_string()
}

fn fields_of(tokens: &[Token]) -> Vec<String> {
    let mut f = Vec::new();
    for t in tokens {
        if matches!(t, Token::Redir(_)) {
            break;
        }
        f.push(t.text());
    }
    f
}

fn redirection_of(tokens: &[Token]) -> Redirection {
    let mut r = Redirection::default();
    let mut in_redir = false;
    for t in tokens {
        if in_redir {
            r.filename = t.text();
            break;
        }
        if let Token::Redir(op) = t {
            in_redir = true;
            r.kind = op.clone();
        }
    }
    r
}

fn expand_env(getenv: &dyn Fn(&str) -> Vec<String>, t: Token) -> Option<Token> {
    match t {
        Token::Group(children) => {
            let mut out = Vec::with_capacity(children.len());
            for sub in children {
                match expand_env(getenv, sub) {
                    Some(t) => out.push(t),
                    // An unset variable inside a concatenation contributes
                    // nothing but keeps the field alive.
                    None => out.push(Token::Str(String::new())),
                }
            }
            Some(distribute_lists(merge_string_tokens(out)))
        }
        Token::Assign { name, value } => {
            let name = expand_env(getenv, *name).unwrap_or(Token::Str(String::new()));
            Some(Token::Assign {
                name: Box::new(name),
                value,
            })
        }
        Token::VarRef { text, is_count } => {
            let mut r = &text[1..];
            if is_count {
                r = &r[1..];
                return Some(Token::Str(getenv(r).len().to_string()));
            }
            let mut index: Option<usize> = None;
            let mut name = r;
            if ARGREF_RE.is_match(r) {
                index = r.parse::<usize>().ok().map(|n| n - 1);
                name = "*";
            } else if let Some(caps) = ARRIDX_RE.captures(r) {
                let idx = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                match idx.parse::<usize>() {
                    Ok(0) | Err(_) => return Some(Token::Str(String::new())),
                    Ok(n) => {
                        index = Some(n - 1);
                        name = &r[..caps.get(0).unwrap().start()];
                    }
                }
            }
            let value = getenv(name);
            match index {
                None => match value.len() {
                    0 => None,
                    1 => Some(Token::Str(value.into_iter().next().unwrap())),
                    _ => Some(Token::List(value)),
                },
                Some(i) => Some(Token::Str(value.get(i).cloned().unwrap_or_default())),
            }
        }
        other => Some(other),
    }
}

/// Fuse plain-string tokens into the preceding token wherever possible.
/// Returns a single token when the whole group collapses.
fn merge_string_tokens(mut list: Vec<Token>) -> Token {
    let mut prev: Option<usize> = None;
    let mut removed = vec![false; list.len()];
    let mut any_merges = false;
    for i in 0..list.len() {
        if list[i].is_adder() && prev.is_none() {
            prev = Some(i);
            continue;
        }
        if matches!(list[i], Token::Str(_)) {
            if let Some(p) = prev {
                if let Token::Str(s) = std::mem::replace(&mut list[i], Token::Str(String::new())) {
                    list[p].add_text(&s);
                }
                removed[i] = true;
                any_merges = true;
            }
        } else {
            prev = None;
        }
    }
    if !any_merges {
        return Token::Group(list);
    }
    let mut dest: Vec<Token> = list
        .into_iter()
        .zip(removed)
        .filter(|(_, r)| !*r)
        .map(|(t, _)| t)
        .collect();
    if dest.len() == 1 {
        dest.pop().unwrap()
    } else {
        Token::Group(dest)
    }
}

/// A group still holding list tokens splits into one field per combination:
/// scalar parts pair with every element of the list-valued parts.
fn distribute_lists(t: Token) -> Token {
    match t {
        Token::Group(children)
            if children.iter().any(|c| matches!(c, Token::List(_)))
                && children
                    .iter()
                    .all(|c| matches!(c, Token::Str(_) | Token::List(_))) =>
        {
            let mut acc = vec![String::new()];
            for child in &children {
                match child {
                    Token::Str(s) => {
                        for a in &mut acc {
                            a.push_str(s);
                        }
                    }
                    Token::List(values) => {
                        acc = acc
                            .iter()
                            .flat_map(|a| values.iter().map(move |v| format!("{a}{v}")))
                            .collect();
                    }
                    _ => {}
                }
            }
            if acc.len() == 1 {
                Token::Str(acc.pop().unwrap())
            } else {
                Token::List(acc)
            }
        }
        other => other,
    }
}

fn flatten_string_lists(list: Vec<Token>) -> Vec<Token> {
    let mut dest = Vec::with_capacity(list.len());
    for t in list {
        match t {
            Token::List(values) => dest.extend(values.into_iter().map(Token::Str)),
            other => dest.push(other),
        }
    }
    dest
}

/// The character-level scanner shared by [`tokenize`] and
/// [`Tokenizer::parse_cmd_line`]. `handle_special` enables the command-mode
/// constructs (`$`, `^`, `#`, `=`, redirections).
struct Lexer<'a> {
    src: &'a str,
    handle_special: bool,

    fields: Vec<Token>,
    /// The open group of the field currently being scanned.
    field: Vec<Token>,
    /// Token under construction; its text is filled in when flushed.
    cur: Option<Token>,
    /// Start of the open text run, if any.
    i0: Option<usize>,

    quoting: bool,
    wasq: bool,

    count_assign: bool,
    seen_assign: bool,
    n_assign: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, handle_special: bool) -> Self {
        Lexer {
            src,
            handle_special,
            fields: Vec::new(),
            field: Vec::new(),
            cur: None,
            i0: None,
            quoting: false,
            wasq: false,
            count_assign: true,
            seen_assign: false,
            n_assign: 0,
        }
    }

    fn run(mut self) -> Result<(Vec<Token>, usize), TokenError> {
        let src = self.src;
        for (i, r) in src.char_indices() {
            if r == '\'' {
                if !self.quoting {
                    if self.wasq {
                        // Reopening right after a close: pull the quote
                        // character itself back into the text run so that
                        // '' inside a quoted string yields a literal quote.
                        self.i0 = self.i0.map(|v| v - 1);
                        self.wasq = false;
                    }
                    self.quoting = true;
                } else {
                    self.quoting = false;
                    self.wasq = true;
                }
                self.flush_token(i);
                self.i0 = Some(i + 1);
                continue;
            }
            self.wasq = false;
            if self.quoting {
                continue;
            }
            if matches!(r, ' ' | '\t' | '\r' | '\n') {
                self.add_field(i);
                continue;
            }
            if !self.handle_special {
                if self.i0.is_none() {
                    self.i0 = Some(i);
                }
                continue;
            }

            match r {
                '<' | '>' => {
                    if !matches!(self.cur, Some(Token::Redir(_))) {
                        self.add_field(i);
                        self.cur = Some(Token::Redir(String::new()));
                        self.i0 = Some(i);
                    }
                }
                '$' => {
                    self.flush_token(i);
                    self.cur = Some(Token::VarRef {
                        text: String::new(),
                        is_count: false,
                    });
                }
                '^' => {
                    if self.i0.is_none() {
                        // At the start of a field, ^ joins with the previous
                        // field; there must be one.
                        if self.fields.is_empty() {
                            return Err(TokenError::Syntax(r));
                        }
                        let prev = self.fields.pop().unwrap();
                        self.field = match prev {
                            Token::Group(g) => g,
                            t => vec![t],
                        };
                    }
                    self.flush_token(i);
                    self.i0 = Some(i + 1);
                }
                '#' => {
                    if let Some(Token::VarRef { is_count, .. }) = &mut self.cur {
                        if *is_count {
                            return Err(TokenError::Syntax(r));
                        }
                        *is_count = true;
                    } else {
                        // Comment: the rest of the line is discarded.
                        self.add_field(i);
                        return Ok((self.fields, self.n_assign));
                    }
                }
                '=' if !matches!(self.cur, Some(Token::Assign { .. }))
                    && self.count_assign
                    && !self.seen_assign
                    && self.i0.is_some() =>
                {
                    self.seen_assign = true;
                    self.flush_token(i);
                    let name = match self.field.len() {
                        1 => self.field.pop().unwrap(),
                        _ => Token::Group(std::mem::take(&mut self.field)),
                    };
                    self.cur = Some(Token::Assign {
                        name: Box::new(name),
                        value: String::new(),
                    });
                }
                _ => {
                    if matches!(self.cur, Some(Token::VarRef { .. }))
                        && !(r.is_alphabetic()
                            || r.is_numeric()
                            || matches!(r, '_' | '*' | '(' | ')'))
                    {
                        // The reference ends here; this character starts a
                        // new text run.
                        self.flush_token(i);
                        continue;
                    }
                    if self.i0.is_none() {
                        self.i0 = Some(i);
                    }
                }
            }
        }
        self.add_field(src.len());
        Ok((self.fields, self.n_assign))
    }

    /// Fill the pending token with the text accumulated since `i0`. When no
    /// token is pending and the open group ends in a plain string, the text
    /// is appended there instead.
    fn set_text(&mut self, text: &str) {
        if self.cur.is_none() {
            if let Some(Token::Str(last)) = self.field.last_mut() {
                last.push_str(text);
                return;
            }
            self.cur = Some(Token::Str(String::new()));
        }
        if let Some(t) = &mut self.cur {
            t.set_text(text);
        }
    }

    /// Close the current field at `i_pos` and append it to the output.
    fn add_field(&mut self, i_pos: usize) {
        let Some(i0) = self.i0 else { return };
        if self.count_assign {
            if self.seen_assign {
                self.n_assign += 1;
                self.seen_assign = false;
            } else {
                self.count_assign = false;
            }
        }
        let src = self.src;
        self.set_text(&src[i0..i_pos]);
        if let Some(t) = self.cur.take() {
            if self.field.is_empty() {
                self.fields.push(t);
            } else {
                self.field.push(t);
            }
        }
        if !self.field.is_empty() {
            let mut f = std::mem::take(&mut self.field);
            if f.len() == 1 {
                self.fields.push(f.pop().unwrap());
            } else {
                self.fields.push(Token::Group(f));
            }
        }
        self.i0 = None;
    }

    /// Close the pending token at `i_pos`, keeping the field open. The next
    /// text run starts at `i_pos`.
    fn flush_token(&mut self, i_pos: usize) {
        let i0 = self.i0.replace(i_pos);
        let Some(i0) = i0 else { return };
        let src = self.src;
        self.set_text(&src[i0..i_pos]);
        if let Some(t) = self.cur.take() {
            self.field.push(t);
        }
    }
}

/// A whitespace-separated field as it appears literally in the source line,
/// with its byte span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Split `s` into quote-aware raw fields without interpreting anything.
///
/// Quotes still delimit (and stay in the text); an unquoted `#` that is not
/// part of a `$#` reference ends the scan. The interpreter uses the spans to
/// carve block bodies out of the original line with quoting and references
/// intact.
pub fn raw_fields(s: &str) -> Vec<RawField> {
    let mut fields = Vec::new();
    let mut start: Option<usize> = None;
    let mut quoting = false;
    let mut prev = None;
    let push = |fields: &mut Vec<RawField>, st: usize, end: usize, s: &str| {
        fields.push(RawField {
            text: s[st..end].to_string(),
            start: st,
            end,
        });
    };
    for (i, r) in s.char_indices() {
        if r == '\'' {
            quoting = !quoting;
            if start.is_none() {
                start = Some(i);
            }
            prev = Some(r);
            continue;
        }
        if !quoting {
            if matches!(r, ' ' | '\t' | '\r' | '\n') {
                if let Some(st) = start.take() {
                    push(&mut fields, st, i, s);
                }
                prev = Some(r);
                continue;
            }
            if r == '#' && prev != Some('$') {
                if let Some(st) = start.take() {
                    push(&mut fields, st, i, s);
                }
                return fields;
            }
        }
        if start.is_none() {
            start = Some(i);
        }
        prev = Some(r);
    }
    if let Some(st) = start {
        push(&mut fields, st, s.len(), s);
    }
    fields
}
