use std::collections::BTreeMap;

use anyhow::anyhow;

use super::{Export, ModulePath, ModuleSource};

#[derive(Debug, Clone)]
struct ModuleEntry {
    source: Option<String>,
    exports: Result<Vec<Export>, String>,
}

impl ModuleEntry {
    fn empty() -> Self {
        Self {
            source: Some(String::new()),
            exports: Ok(Vec::new()),
        }
    }
}

/// Module tree held in memory.
///
/// Registering `a::b::c` creates empty `a` and `a::b` modules if they do not
/// exist yet, so every registered module is reachable from its root.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    modules: BTreeMap<ModulePath, ModuleEntry>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module with source text and exports
    pub fn module(self, path: &str, source: impl Into<String>, exports: Vec<Export>) -> Self {
        self.insert(
            path,
            ModuleEntry {
                source: Some(source.into()),
                exports: Ok(exports),
            },
        )
    }

    /// Add a module whose source text cannot be read
    pub fn opaque(self, path: &str, exports: Vec<Export>) -> Self {
        self.insert(
            path,
            ModuleEntry {
                source: None,
                exports: Ok(exports),
            },
        )
    }

    /// Add a module that fails to import with `error`
    pub fn broken(self, path: &str, source: impl Into<String>, error: impl Into<String>) -> Self {
        self.insert(
            path,
            ModuleEntry {
                source: Some(source.into()),
                exports: Err(error.into()),
            },
        )
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn insert(mut self, path: &str, entry: ModuleEntry) -> Self {
        let path = ModulePath::new(path);
        for ancestor in path.lineage() {
            if ancestor != path {
                self.modules.entry(ancestor).or_insert_with(ModuleEntry::empty);
            }
        }
        self.modules.insert(path, entry);
        self
    }
}

impl ModuleSource for InMemorySource {
    fn contains(&self, module: &ModulePath) -> bool {
        self.modules.contains_key(module)
    }

    fn submodules(&self, module: &ModulePath) -> Vec<ModulePath> {
        self.modules
            .keys()
            .filter(|candidate| candidate.parent().as_ref() == Some(module))
            .cloned()
            .collect()
    }

    fn read_source(&self, module: &ModulePath) -> Option<String> {
        self.modules.get(module)?.source.clone()
    }

    fn import(&self, module: &ModulePath) -> anyhow::Result<Vec<Export>> {
        let entry = self
            .modules
            .get(module)
            .ok_or_else(|| anyhow!("No module named {}", module))?;
        entry.exports.clone().map_err(|e| anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ParallelRoutine;

    #[test]
    fn test_ancestors_are_created() {
        let source = InMemorySource::new().module("a::b::c", "", vec![]);
        assert_eq!(source.len(), 3);
        assert!(source.contains(&"a::b".into()));
        assert_eq!(source.submodules(&"a".into()), vec![ModulePath::new("a::b")]);
        assert_eq!(source.read_source(&"a::b".into()).as_deref(), Some(""));
    }

    #[test]
    fn test_import_results() {
        let source = InMemorySource::new()
            .module(
                "app",
                "#[parallel]",
                vec![
                    Export::tagged(ParallelRoutine::new("foo", 0, |_ctx| Ok(()))),
                    Export::plain("baz"),
                ],
            )
            .broken("app::bad", "", "missing dependency numpy");

        let exports = source.import(&"app".into()).unwrap();
        assert_eq!(exports.len(), 2);
        assert!(exports[1].routine.is_none());

        let err = source.import(&"app::bad".into()).unwrap_err();
        assert_eq!(err.to_string(), "missing dependency numpy");
        assert!(source.import(&"nowhere".into()).is_err());
    }

    #[test]
    fn test_existing_parent_is_not_overwritten() {
        let source = InMemorySource::new()
            .module("app", "#[parallel] top", vec![])
            .module("app::child", "", vec![]);
        assert_eq!(
            source.read_source(&"app".into()).as_deref(),
            Some("#[parallel] top")
        );
    }
}
