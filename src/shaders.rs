//! Shader byte code registry.
//!
//! Compiling or reflecting shaders is outside the engine; the caller loads
//! SPIR-V from wherever it lives and registers the words here under the names
//! the pass modules look up. A missing entry is a fatal setup error.

use std::collections::HashMap;

use anyhow::Result;

use crate::core::error::Error;

/// Name-keyed SPIR-V modules, supplied by the caller at initialization.
#[derive(Default)]
pub struct ShaderSet {
    modules: HashMap<String, Vec<u32>>,
}

impl std::fmt::Debug for ShaderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.modules.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("ShaderSet").field("modules", &names).finish()
    }
}

impl ShaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register SPIR-V words under a name.
    pub fn insert(&mut self, name: impl Into<String>, words: Vec<u32>) {
        self.modules.insert(name.into(), words);
    }

    /// Whether a module was registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Look up a module.
    /// # Errors
    /// [`Error::NoShader`] when the caller never registered the name.
    pub fn get(&self, name: &str) -> Result<&[u32]> {
        self.modules
            .get(name)
            .map(|words| words.as_slice())
            .ok_or_else(|| Error::NoShader(name.to_owned()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_shader_is_fatal() {
        let set = ShaderSet::new();
        let err = set.get("taa.frag").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NoShader(name)) if name == "taa.frag"));
    }
}
