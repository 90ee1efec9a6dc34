//! The interpreter's view of its variable environment.

use rcstring::{EnvMap, EnvStack};

/// Interpreter environment: an [`EnvStack`] whose global frame carries the
/// variables the interpreter itself consumes: `prefix` (line prefix
/// template), `OFS` (output field separator), and `0` (program name). The
/// positional list `*` is managed by function calls and `shift`.
pub struct Env {
    stack: EnvStack,
}

impl Env {
    pub fn new() -> Self {
        let mut global = EnvMap::new();
        global.insert("prefix".to_string(), Vec::new());
        global.insert("OFS".to_string(), vec![" ".to_string()]);
        global.insert("0".to_string(), vec!["rc".to_string()]);
        let mut stack = EnvStack::new();
        stack.push(global);
        Self { stack }
    }

    /// First value of a variable, or the empty string.
    pub fn getenv(&self, name: &str) -> String {
        self.stack.get(name).into_iter().next().unwrap_or_default()
    }

    /// Bind a single-valued variable in the topmost frame.
    pub fn setenv(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.stack.set(name, vec![value.into()]);
    }

    pub fn stack(&self) -> &EnvStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut EnvStack {
        &mut self.stack
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let env = Env::new();
        assert_eq!(env.getenv("OFS"), " ");
        assert_eq!(env.getenv("0"), "rc");
        assert_eq!(env.getenv("prefix"), "");
        assert_eq!(env.getenv("*"), "");
    }

    #[test]
    fn test_setenv_getenv() {
        let mut env = Env::new();
        env.setenv("greeting", "hello");
        assert_eq!(env.getenv("greeting"), "hello");
    }
}
