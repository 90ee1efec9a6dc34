//! The tiny template language used for the `prefix` variable.
//!
//! A template is literal text with embedded `{{ … }}` actions. An action is
//! an integer expression built from the functions `now` (milliseconds since
//! the epoch), `t0` (the same clock, captured when the session started) and
//! `div A B`, plus integer literals and parentheses. `{{div (now) 1000}}`
//! renders the current time in seconds.
//!
//! Compiled templates are cached by their source text, so the per-line cost
//! of a prefix is one evaluation, not one parse.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) struct TemplateMap {
    t0_ms: i64,
    cache: HashMap<String, Rc<Template>>,
    n_max: usize,
}

impl TemplateMap {
    pub(crate) fn new(n_max: usize) -> Self {
        Self {
            t0_ms: now_ms(),
            cache: HashMap::with_capacity(n_max),
            n_max,
        }
    }

    /// The compiled form of `src`, from the cache when possible.
    pub(crate) fn get(&mut self, src: &str) -> Result<Rc<Template>, String> {
        if let Some(t) = self.cache.get(src) {
            return Ok(Rc::clone(t));
        }
        let t = Rc::new(Template::parse(src, self.t0_ms)?);
        if self.cache.len() < self.n_max {
            self.cache.insert(src.to_string(), Rc::clone(&t));
        }
        Ok(t)
    }
}

pub(crate) struct Template {
    parts: Vec<Part>,
    t0_ms: i64,
}

enum Part {
    Lit(String),
    Expr(Expr),
}

enum Expr {
    Num(i64),
    Now,
    T0,
    Div(Box<Expr>, Box<Expr>),
}

impl Template {
    fn parse(src: &str, t0_ms: i64) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut rest = src;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Lit(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| "unclosed {{ action".to_string())?;
            parts.push(Part::Expr(parse_action(&after[..close])?));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Lit(rest.to_string()));
        }
        Ok(Template { parts, t0_ms })
    }

    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Lit(s) => out.push_str(s),
                Part::Expr(e) => out.push_str(&e.eval(self.t0_ms).to_string()),
            }
        }
        out
    }
}

impl Expr {
    fn eval(&self, t0_ms: i64) -> i64 {
        match self {
            Expr::Num(n) => *n,
            Expr::Now => now_ms(),
            Expr::T0 => t0_ms,
            Expr::Div(a, b) => {
                let divisor = b.eval(t0_ms);
                if divisor == 0 {
                    0
                } else {
                    a.eval(t0_ms) / divisor
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parse_action(src: &str) -> Result<Expr, String> {
    let tokens = scan_action(src);
    let mut pos = 0;
    let expr = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected '{}' in action", tokens[pos]));
    }
    Ok(expr)
}

fn scan_action(src: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for r in src.chars() {
        match r {
            '(' | ')' => {
                if !word.is_empty() {
                    tokens.push(std::mem::take(&mut word));
                }
                tokens.push(r.to_string());
            }
            r if r.is_whitespace() => {
                if !word.is_empty() {
                    tokens.push(std::mem::take(&mut word));
                }
            }
            r => word.push(r),
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

/// A full expression: a function applied to its arguments, or an atom.
fn parse_expr(tokens: &[String], pos: &mut usize) -> Result<Expr, String> {
    match tokens.get(*pos).map(String::as_str) {
        Some("div") => {
            *pos += 1;
            let a = parse_atom(tokens, pos)?;
            let b = parse_atom(tokens, pos)?;
            Ok(Expr::Div(Box::new(a), Box::new(b)))
        }
        _ => parse_atom(tokens, pos),
    }
}

/// An atom: a parenthesized expression, an integer, `now` or `t0`.
fn parse_atom(tokens: &[String], pos: &mut usize) -> Result<Expr, String> {
    let tok = tokens
        .get(*pos)
        .ok_or_else(|| "missing operand in action".to_string())?;
    *pos += 1;
    match tok.as_str() {
        "(" => {
            let e = parse_expr(tokens, pos)?;
            if tokens.get(*pos).map(String::as_str) != Some(")") {
                return Err("missing ')' in action".to_string());
            }
            *pos += 1;
            Ok(e)
        }
        "now" => Ok(Expr::Now),
        "t0" => Ok(Expr::T0),
        t => t
            .parse::<i64>()
            .map(Expr::Num)
            .map_err(|_| format!("unknown function {:?}", t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_only() {
        let t = Template::parse("plain> ", 0).unwrap();
        assert_eq!(t.render(), "plain> ");
    }

    #[test]
    fn test_div_and_literals() {
        let t = Template::parse("[{{div 10 4}}] ", 0).unwrap();
        assert_eq!(t.render(), "[2] ");
    }

    #[test]
    fn test_nested_call() {
        let t = Template::parse("{{div (div 100 5) 2}}", 0).unwrap();
        assert_eq!(t.render(), "10");
    }

    #[test]
    fn test_now_is_not_behind_t0() {
        let t0 = now_ms();
        let t = Template::parse("{{now}}", t0).unwrap();
        let rendered: i64 = t.render().parse().unwrap();
        assert!(rendered >= t0);
    }

    #[test]
    fn test_division_by_zero_renders_zero() {
        let t = Template::parse("{{div 5 0}}", 0).unwrap();
        assert_eq!(t.render(), "0");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Template::parse("{{div 1", 0).is_err());
        assert!(Template::parse("{{frob}}", 0).is_err());
        assert!(Template::parse("{{div 1 2 3}}", 0).is_err());
    }

    #[test]
    fn test_cache_reuses_compiled_template() {
        let mut map = TemplateMap::new(4);
        let a = map.get("x{{t0}}").unwrap();
        let b = map.get("x{{t0}}").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
