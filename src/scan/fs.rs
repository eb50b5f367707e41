//! Source tree on disk.
//!
//! `.rs` files under a crate's source directory are mapped to module paths
//! the way rustc maps them (`lib.rs`/`main.rs` is the crate root, `mod.rs`
//! names its directory). Importing a module resolves the `#[parallel]`
//! routines linked from that file.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context as _};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use super::{Export, ModulePath, ModuleSource};
use crate::registry::{ParallelRoutine, RoutineDecl, PARALLEL_ROUTINES};

const CRATE_ROOTS: [&str; 2] = ["lib.rs", "main.rs"];

#[derive(Debug, Clone)]
struct ModuleFile {
    /// Absolute location, None for directories without a module file
    path: Option<PathBuf>,
    /// Location as rustc reports it, relative to the crate directory
    relative: PathBuf,
}

/// Crate source directory scanned from disk
pub struct FsSource {
    crate_name: String,
    src_dir: PathBuf,
    decls: &'static [RoutineDecl],
    modules: BTreeMap<ModulePath, ModuleFile>,
}

impl FsSource {
    /// Index `src_dir` as crate `crate_name`, matched against every linked
    /// declaration
    pub fn new(crate_name: impl Into<String>, src_dir: impl Into<PathBuf>) -> Self {
        Self::with_decls(crate_name, src_dir, &PARALLEL_ROUTINES)
    }

    pub fn with_decls(
        crate_name: impl Into<String>,
        src_dir: impl Into<PathBuf>,
        decls: &'static [RoutineDecl],
    ) -> Self {
        let crate_name = crate_name.into().replace('-', "_");
        let src_dir = src_dir.into();
        let modules = index_modules(&crate_name, &src_dir);
        debug!(
            crate_name = %crate_name,
            src_dir = %src_dir.display(),
            modules = modules.len(),
            "indexed source tree"
        );
        Self {
            crate_name,
            src_dir,
            decls,
            modules,
        }
    }

    pub fn crate_name(&self) -> &str {
        &self.crate_name
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    /// Indexed module paths in order
    pub fn modules(&self) -> impl Iterator<Item = &ModulePath> {
        self.modules.keys()
    }
}

impl ModuleSource for FsSource {
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
        let file = self.modules.get(module)?;
        match &file.path {
            Some(path) => std::fs::read_to_string(path).ok(),
            None => Some(String::new()),
        }
    }

    fn import(&self, module: &ModulePath) -> anyhow::Result<Vec<Export>> {
        let file = self
            .modules
            .get(module)
            .ok_or_else(|| anyhow!("No module named {} under {}", module, self.src_dir.display()))?;
        let Some(path) = &file.path else {
            return Ok(Vec::new());
        };
        // Same failure a reader would hit; a vanished file is not importable.
        std::fs::metadata(path).with_context(|| format!("Cannot load {}", path.display()))?;

        let exports: Vec<Export> = self
            .decls
            .iter()
            .filter(|decl| decl_in_crate(decl, &self.crate_name))
            .filter(|decl| Path::new(decl.file).ends_with(&file.relative))
            .map(|decl| Export::tagged(ParallelRoutine::from(decl)))
            .collect();

        if exports.is_empty() {
            debug!(%module, file = %path.display(), "no linked parallel routines in module");
        }
        Ok(exports)
    }
}

fn decl_in_crate(decl: &RoutineDecl, crate_name: &str) -> bool {
    ModulePath::new(decl.module)
        .lineage()
        .first()
        .is_some_and(|root| root.as_str() == crate_name)
}

fn index_modules(crate_name: &str, src_dir: &Path) -> BTreeMap<ModulePath, ModuleFile> {
    let src_name = src_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();
    let mut modules = BTreeMap::new();

    let walker = WalkBuilder::new(src_dir)
        .standard_filters(true)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "source walk entry error");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.into_path();
        let Ok(relative) = path.strip_prefix(src_dir) else {
            continue;
        };
        let Some(module) = module_path_for(crate_name, relative) else {
            continue;
        };

        for ancestor in module.lineage() {
            if ancestor != module {
                modules.entry(ancestor).or_insert_with(|| ModuleFile {
                    path: None,
                    relative: PathBuf::new(),
                });
            }
        }
        modules.insert(
            module,
            ModuleFile {
                relative: src_name.join(relative),
                path: Some(path),
            },
        );
    }

    modules
}

/// Module path of the file at `relative` (below the source directory)
fn module_path_for(crate_name: &str, relative: &Path) -> Option<ModulePath> {
    if relative.extension().and_then(|e| e.to_str()) != Some("rs") {
        return None;
    }
    let mut segments: Vec<String> = Vec::new();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            return None;
        };
        segments.push(part.to_str()?.to_string());
    }

    // Binaries under src/bin are separate crates.
    if segments.len() > 1 && segments[0] == "bin" {
        return None;
    }

    let file = segments.pop()?;
    let stem = file.strip_suffix(".rs")?;
    let is_root = segments.is_empty() && CRATE_ROOTS.contains(&file.as_str());
    if !is_root && stem != "mod" {
        segments.push(stem.to_string());
    }

    let mut module = ModulePath::new(crate_name);
    for segment in &segments {
        module = module.join(segment);
    }
    Some(module)
}
