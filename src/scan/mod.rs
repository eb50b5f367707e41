//! Source scanning: find the modules that may hold tagged routines.
//!
//! The scanner walks module trees depth-first from a set of roots and yields
//! candidates lazily. With a marker configured it reads each module's source
//! first and skips modules whose text lacks the marker, so they are never
//! imported.

pub mod fs;
pub mod linked;
pub mod memory;

pub use fs::FsSource;
pub use linked::LinkedSource;
pub use memory::InMemorySource;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::core::config::SessionConfig;
use crate::core::errors::Diagnostic;
use crate::registry::ParallelRoutine;

/// Separator between module path segments
pub const PATH_SEPARATOR: &str = "::";

/// Fully-qualified module identity, e.g. `app::solver::cg`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModulePath(String);

impl ModulePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Child module `self::segment`
    pub fn join(&self, segment: &str) -> Self {
        Self(format!("{}{}{}", self.0, PATH_SEPARATOR, segment))
    }

    /// Enclosing module, or None for a root
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rfind(PATH_SEPARATOR)
            .map(|idx| Self(self.0[..idx].to_string()))
    }

    /// Final segment
    pub fn name(&self) -> &str {
        self.0
            .rfind(PATH_SEPARATOR)
            .map(|idx| &self.0[idx + PATH_SEPARATOR.len()..])
            .unwrap_or(&self.0)
    }

    /// This path and each of its ancestors, outermost first
    pub fn lineage(&self) -> Vec<Self> {
        let mut lineage = vec![self.clone()];
        let mut current = self.parent();
        while let Some(parent) = current {
            current = parent.parent();
            lineage.push(parent);
        }
        lineage.reverse();
        lineage
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModulePath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// A top-level callable exposed by an imported module
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    /// Set when the callable is tagged as parallel
    pub routine: Option<ParallelRoutine>,
}

impl Export {
    pub fn tagged(routine: ParallelRoutine) -> Self {
        Self {
            name: routine.name().to_string(),
            routine: Some(routine),
        }
    }

    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routine: None,
        }
    }
}

/// Where modules come from: enumeration, raw source, import
pub trait ModuleSource {
    /// Whether `module` exists
    fn contains(&self, module: &ModulePath) -> bool;

    /// Direct submodules of `module`
    fn submodules(&self, module: &ModulePath) -> Vec<ModulePath>;

    /// Raw source text, if it can be read
    fn read_source(&self, module: &ModulePath) -> Option<String>;

    /// Import `module` and list its top-level callables
    fn import(&self, module: &ModulePath) -> anyhow::Result<Vec<Export>>;
}

/// One step of a scan
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Import this module
    Candidate(ModulePath),
    /// Source lacks the marker; not imported
    Skipped(ModulePath),
    Diagnostic(Diagnostic),
}

/// Depth-first module scanner
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    roots: Vec<String>,
    marker: Option<String>,
}

impl Scanner {
    /// Scan from `roots`, importing every module (no marker)
    pub fn new<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            marker: None,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.roots.iter().cloned()).with_marker(config.marker.clone())
    }

    /// Require `marker` in a module's source before importing it
    pub fn with_marker(mut self, marker: Option<String>) -> Self {
        self.marker = marker;
        self
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    /// Lazily walk `source`
    pub fn scan<'a, S>(&'a self, source: &'a S) -> ScanIter<'a, S>
    where
        S: ModuleSource + ?Sized,
    {
        ScanIter {
            scanner: self,
            source,
            next_root: 0,
            stack: Vec::new(),
            seen: HashSet::new(),
            deferred: None,
        }
    }

    /// Candidate modules only, discarding skips and diagnostics
    pub fn candidates<'a, S>(&'a self, source: &'a S) -> impl Iterator<Item = ModulePath> + 'a
    where
        S: ModuleSource + ?Sized,
    {
        self.scan(source).filter_map(|event| match event {
            ScanEvent::Candidate(module) => Some(module),
            _ => None,
        })
    }
}

/// Iterator returned by [`Scanner::scan`]
pub struct ScanIter<'a, S: ModuleSource + ?Sized> {
    scanner: &'a Scanner,
    source: &'a S,
    next_root: usize,
    stack: Vec<ModulePath>,
    seen: HashSet<ModulePath>,
    deferred: Option<ScanEvent>,
}

impl<'a, S: ModuleSource + ?Sized> ScanIter<'a, S> {
    fn visit(&mut self, module: ModulePath) -> ScanEvent {
        let mut children = self.source.submodules(&module);
        children.sort();
        children.dedup();
        // Reversed so the smallest child is popped first.
        self.stack.extend(children.into_iter().rev());

        let Some(marker) = self.scanner.marker.as_deref() else {
            return ScanEvent::Candidate(module);
        };

        match self.source.read_source(&module) {
            Some(text) if text.contains(marker) => ScanEvent::Candidate(module),
            Some(_) => {
                trace!(%module, "marker absent, skipping");
                ScanEvent::Skipped(module)
            }
            None => {
                let diagnostic = Diagnostic::UnreadableSource {
                    module: module.to_string(),
                };
                self.deferred = Some(ScanEvent::Candidate(module));
                ScanEvent::Diagnostic(diagnostic)
            }
        }
    }
}

impl<'a, S: ModuleSource + ?Sized> Iterator for ScanIter<'a, S> {
    type Item = ScanEvent;

    fn next(&mut self) -> Option<ScanEvent> {
        loop {
            if let Some(event) = self.deferred.take() {
                return Some(event);
            }

            if let Some(module) = self.stack.pop() {
                if !self.seen.insert(module.clone()) {
                    continue;
                }
                return Some(self.visit(module));
            }

            let root = self.scanner.roots.get(self.next_root)?;
            self.next_root += 1;
            let root = ModulePath::new(root.as_str());
            if self.source.contains(&root) {
                debug!(%root, "scanning root");
                self.stack.push(root);
            } else {
                return Some(ScanEvent::Diagnostic(Diagnostic::MissingRoot {
                    root: root.to_string(),
                }));
            }
        }
    }
}
