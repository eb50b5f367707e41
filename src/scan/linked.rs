use std::collections::BTreeSet;

use anyhow::anyhow;

use super::{Export, ModulePath, ModuleSource};
use crate::registry::{ParallelRoutine, RoutineDecl, PARALLEL_ROUTINES};

/// Modules that contributed `#[parallel]` routines to this binary.
///
/// Linked modules carry no source text, so scan them without a marker.
pub struct LinkedSource {
    decls: &'static [RoutineDecl],
    modules: BTreeSet<ModulePath>,
}

impl LinkedSource {
    /// Every declaration linked into the binary
    pub fn new() -> Self {
        Self::from_decls(&PARALLEL_ROUTINES)
    }

    pub fn from_decls(decls: &'static [RoutineDecl]) -> Self {
        let modules = decls
            .iter()
            .flat_map(|decl| ModulePath::new(decl.module).lineage())
            .collect();
        Self { decls, modules }
    }

    pub fn decls(&self) -> &'static [RoutineDecl] {
        self.decls
    }
}

impl Default for LinkedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleSource for LinkedSource {
    fn contains(&self, module: &ModulePath) -> bool {
        self.modules.contains(module)
    }

    fn submodules(&self, module: &ModulePath) -> Vec<ModulePath> {
        self.modules
            .iter()
            .filter(|candidate| candidate.parent().as_ref() == Some(module))
            .cloned()
            .collect()
    }

    fn read_source(&self, _module: &ModulePath) -> Option<String> {
        None
    }

    fn import(&self, module: &ModulePath) -> anyhow::Result<Vec<Export>> {
        if !self.modules.contains(module) {
            return Err(anyhow!("No linked module named {}", module));
        }
        Ok(self
            .decls
            .iter()
            .filter(|decl| decl.module == module.as_str())
            .map(|decl| Export::tagged(ParallelRoutine::from(decl)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Context;
    use crate::registry::FunctionTable;
    use crate::scan::Scanner;
    use pretty_assertions::assert_eq;

    fn entry(_ctx: &Context<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    static DECLS: [RoutineDecl; 3] = [
        RoutineDecl {
            name: "assemble",
            arity: 1,
            module: "solver::fem",
            file: "src/solver/fem.rs",
            entry,
        },
        RoutineDecl {
            name: "solve",
            arity: 2,
            module: "solver::fem",
            file: "src/solver/fem.rs",
            entry,
        },
        RoutineDecl {
            name: "report",
            arity: 0,
            module: "solver::io",
            file: "src/solver/io.rs",
            entry,
        },
    ];

    #[test]
    fn test_module_tree_from_decls() {
        let source = LinkedSource::from_decls(&DECLS);
        assert!(source.contains(&"solver".into()));
        assert_eq!(
            source.submodules(&"solver".into()),
            vec![ModulePath::new("solver::fem"), ModulePath::new("solver::io")]
        );
        assert!(source.import(&"solver".into()).unwrap().is_empty());
        assert_eq!(source.import(&"solver::fem".into()).unwrap().len(), 2);
    }

    #[test]
    fn test_scan_matches_direct_table() {
        let source = LinkedSource::from_decls(&DECLS);
        let (scanned, report) = FunctionTable::discover(&source, &Scanner::new(["solver"]));
        assert!(report.is_clean());
        assert_eq!(scanned.assignments(), FunctionTable::from_decls(&DECLS).assignments());
        assert_eq!(scanned.by_name("report").unwrap().origin(), "solver::io");
    }
}
