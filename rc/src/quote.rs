//! Quoting strings so that the tokenizer reads them back unchanged.

/// Whether `r` forces a string to be single-quoted.
///
/// Whitespace, control characters and rc's special characters all need
/// quoting; characters outside ASCII never do.
pub fn needs_quote(r: char) -> bool {
    if r <= ' ' {
        return true;
    }
    if r >= '\u{80}' {
        return false;
    }
    "`^#*[]=|\\?${}()'<>&;".contains(r)
}

/// Quote `s` so that `tokenize` yields it as a single literal field.
///
/// If no character of `s` needs quoting the string is returned unchanged;
/// otherwise the whole string is wrapped in single quotes with interior
/// quotes doubled. The empty string quotes to itself.
pub fn quote(s: &str) -> String {
    if s.chars().any(needs_quote) {
        let mut q = String::with_capacity(s.len() + 2);
        q.push('\'');
        for r in s.chars() {
            if r == '\'' {
                q.push('\'');
            }
            q.push(r);
        }
        q.push('\'');
        return q;
    }
    s.to_string()
}

/// Like [`quote`], but `=` stays verbatim and acts as a split point, so an
/// assignment keeps its shape on the way out: `a=b c` renders as `a='b c'`
/// rather than `'a=b c'`.
pub fn quote_cmd(s: &str) -> String {
    let parts: Vec<String> = s.split('=').map(quote).collect();
    parts.join("=")
}

/// Join `list` into one line, quoting each element with [`quote`].
pub fn join(list: &[String]) -> String {
    join_with(list, quote)
}

/// Join `list` into one line, quoting each element with [`quote_cmd`].
pub fn join_cmd(list: &[String]) -> String {
    join_with(list, quote_cmd)
}

fn join_with(list: &[String], q: fn(&str) -> String) -> String {
    let mut js = String::new();
    for (i, s) in list.iter().enumerate() {
        if i != 0 {
            js.push(' ');
        }
        js.push_str(&q(s));
    }
    js
}
