use std::collections::HashMap;

/// Map from a variable name to its list of values.
///
/// Variables are list-valued as in rc; a missing entry and an empty list both
/// mean "unset".
pub type EnvMap = HashMap<String, Vec<String>>;

/// A LIFO stack of [`EnvMap`] frames.
///
/// Lookup walks from the innermost frame outwards and returns the first
/// binding found. Writes always go to the innermost frame, so a pushed frame
/// can shadow outer bindings and take all its changes with it when popped.
/// The interpreter uses this for inline assignments (`a=1 cmd`) and for
/// function-local argument lists.
#[derive(Debug, Default, Clone)]
pub struct EnvStack {
    frames: Vec<EnvMap>,
}

impl EnvStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `map` onto the stack.
    pub fn push(&mut self, map: EnvMap) {
        self.frames.push(map);
    }

    /// Push a fresh, empty frame.
    pub fn push_new(&mut self) {
        self.frames.push(EnvMap::new());
    }

    /// Remove the topmost frame.
    ///
    /// Callers are expected to balance their own pushes; popping an empty
    /// stack does nothing.
    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// The value of a variable, taken from the innermost frame that binds it.
    /// An unbound name yields an empty list.
    pub fn get(&self, name: &str) -> Vec<String> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get(name) {
                return value.clone();
            }
        }
        Vec::new()
    }

    /// Set a variable in the topmost frame.
    pub fn set(&mut self, name: impl Into<String>, value: Vec<String>) {
        if let Some(top) = self.frames.last_mut() {
            top.insert(name.into(), value);
        }
    }

    /// Copy all bindings from `map` into the topmost frame, overwriting
    /// existing names.
    pub fn insert(&mut self, map: EnvMap) {
        if let Some(top) = self.frames.last_mut() {
            top.extend(map);
        }
    }

    /// Number of frames currently on the stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}
