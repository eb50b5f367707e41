//! Function registry: the id table every rank builds on its own.
//!
//! Ids are assigned by sorting routine names, so two ranks that see the same
//! set of names agree on every id without exchanging a single message.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::core::errors::Diagnostic;
use crate::dispatch::{Context, DispatchId};
use crate::scan::{ModulePath, ModuleSource, ScanEvent, Scanner};

/// Worker-side entry point emitted by `#[parallel]`
pub type RoutineEntry = fn(&Context<'_>) -> anyhow::Result<()>;

type RoutineBody = dyn Fn(&Context<'_>) -> anyhow::Result<()> + Send + Sync;

/// Origin recorded for routines registered by hand
pub const REGISTERED_ORIGIN: &str = "<registered>";

/// Link-time record of a tagged routine
#[derive(Debug, Clone, Copy)]
pub struct RoutineDecl {
    pub name: &'static str,
    pub arity: usize,
    /// `module_path!()` at the definition site
    pub module: &'static str,
    /// `file!()` at the definition site
    pub file: &'static str,
    pub entry: RoutineEntry,
}

/// Every routine tagged with `#[parallel]` in the final binary
#[linkme::distributed_slice]
pub static PARALLEL_ROUTINES: [RoutineDecl] = [..];

/// A routine that can be dispatched by id
#[derive(Clone)]
pub struct ParallelRoutine {
    name: String,
    arity: usize,
    origin: String,
    body: Arc<RoutineBody>,
}

impl ParallelRoutine {
    /// Register a routine by hand. `body` is what a worker runs when the
    /// routine's id arrives.
    pub fn new<F>(name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&Context<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            origin: REGISTERED_ORIGIN.to_string(),
            body: Arc::new(body),
        }
    }

    /// Set the module this routine was found in
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter count, excluding the context
    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub(crate) fn call(&self, ctx: &Context<'_>) -> anyhow::Result<()> {
        (self.body)(ctx)
    }
}

impl From<&RoutineDecl> for ParallelRoutine {
    fn from(decl: &RoutineDecl) -> Self {
        let entry = decl.entry;
        Self {
            name: decl.name.to_string(),
            arity: decl.arity,
            origin: decl.module.to_string(),
            body: Arc::new(entry),
        }
    }
}

impl fmt::Debug for ParallelRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelRoutine")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("origin", &self.origin)
            .finish()
    }
}

/// What a registry build saw, for comparing ranks before dispatching
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    /// Modules imported successfully, in scan order
    pub imported: Vec<String>,
    /// Modules skipped because their source lacks the marker
    pub skipped: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildReport {
    /// True when nothing could have made this rank's table differ from a peer's
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    fn record(&mut self, diagnostic: Diagnostic) {
        warn!(%diagnostic, "registry diagnostic");
        self.diagnostics.push(diagnostic);
    }
}

/// Collects routines in any order; `finish` sorts them into a table
#[derive(Default)]
pub struct FunctionTableBuilder {
    collected: HashMap<String, ParallelRoutine>,
    collisions: Vec<Diagnostic>,
}

impl FunctionTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a routine (chainable form of [`insert`](Self::insert))
    pub fn register(mut self, routine: ParallelRoutine) -> Self {
        self.insert(routine);
        self
    }

    /// Add a routine. A routine with the same name replaces the earlier one;
    /// the collision is returned and kept for [`collisions`](Self::collisions).
    ///
    /// Which routine survives depends on registration order and is not part
    /// of any contract.
    pub fn insert(&mut self, routine: ParallelRoutine) -> Option<Diagnostic> {
        let name = routine.name.clone();
        let kept = routine.origin.clone();
        let previous = self.collected.insert(name.clone(), routine)?;
        let diagnostic = Diagnostic::NameCollision {
            name,
            kept,
            replaced: previous.origin,
        };
        self.collisions.push(diagnostic.clone());
        Some(diagnostic)
    }

    pub fn collisions(&self) -> &[Diagnostic] {
        &self.collisions
    }

    pub fn len(&self) -> usize {
        self.collected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collected.is_empty()
    }

    /// Sort by name and assign ids `0..n`
    pub fn finish(self) -> FunctionTable {
        let mut routines: Vec<ParallelRoutine> = self.collected.into_values().collect();
        routines.sort_by(|a, b| a.name.cmp(&b.name));
        let ids = routines
            .iter()
            .enumerate()
            .map(|(id, routine)| (routine.name.clone(), id))
            .collect();
        FunctionTable { routines, ids }
    }
}

/// Ordered id → routine table plus the name → id index
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    routines: Vec<ParallelRoutine>,
    ids: HashMap<String, usize>,
}

impl FunctionTable {
    pub fn builder() -> FunctionTableBuilder {
        FunctionTableBuilder::new()
    }

    /// Build from explicitly registered routines
    pub fn from_routines(routines: impl IntoIterator<Item = ParallelRoutine>) -> Self {
        routines
            .into_iter()
            .fold(FunctionTableBuilder::new(), FunctionTableBuilder::register)
            .finish()
    }

    /// Build from link-time declarations
    pub fn from_decls(decls: &[RoutineDecl]) -> Self {
        Self::from_routines(decls.iter().map(ParallelRoutine::from))
    }

    /// Every `#[parallel]` routine linked into this binary.
    ///
    /// Link order is unspecified, so a name defined twice resolves
    /// arbitrarily; use a scanned or explicit table if that matters.
    pub fn linked() -> Self {
        Self::from_decls(&PARALLEL_ROUTINES)
    }

    /// Import each module and collect its tagged exports.
    ///
    /// Import failures are recorded and the module skipped. Later modules win
    /// name collisions.
    pub fn build<S, I>(source: &S, modules: I) -> (Self, BuildReport)
    where
        S: ModuleSource + ?Sized,
        I: IntoIterator<Item = ModulePath>,
    {
        let mut builder = FunctionTableBuilder::new();
        let mut report = BuildReport::default();
        for module in modules {
            import_into(source, &module, &mut builder, &mut report);
        }
        (builder.finish(), report)
    }

    /// Scan `source` from the scanner's roots and build from what it yields
    pub fn discover<S>(source: &S, scanner: &Scanner) -> (Self, BuildReport)
    where
        S: ModuleSource + ?Sized,
    {
        let mut builder = FunctionTableBuilder::new();
        let mut report = BuildReport::default();
        for event in scanner.scan(source) {
            match event {
                ScanEvent::Candidate(module) => {
                    import_into(source, &module, &mut builder, &mut report)
                }
                ScanEvent::Skipped(module) => report.skipped.push(module.to_string()),
                ScanEvent::Diagnostic(diagnostic) => report.record(diagnostic),
            }
        }
        let table = builder.finish();
        debug!(
            routines = table.len(),
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            "function table discovered"
        );
        (table, report)
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Id assigned to `name`
    pub fn id_of(&self, name: &str) -> Option<DispatchId> {
        self.ids.get(name).map(|&id| id as DispatchId)
    }

    /// Routine for `id`; negative and out-of-range ids have none
    pub fn get(&self, id: DispatchId) -> Option<&ParallelRoutine> {
        usize::try_from(id).ok().and_then(|idx| self.routines.get(idx))
    }

    pub fn by_name(&self, name: &str) -> Option<&ParallelRoutine> {
        self.ids.get(name).map(|&idx| &self.routines[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParallelRoutine> {
        self.routines.iter()
    }

    /// Names in id order
    pub fn names(&self) -> Vec<&str> {
        self.routines.iter().map(|r| r.name.as_str()).collect()
    }

    /// `(name, id)` pairs in id order
    pub fn assignments(&self) -> Vec<(String, DispatchId)> {
        self.routines
            .iter()
            .enumerate()
            .map(|(id, r)| (r.name.clone(), id as DispatchId))
            .collect()
    }

    /// Digest of the ordered names and arities. Equal fingerprints mean equal
    /// id assignments.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for routine in &self.routines {
            hasher.update(routine.name.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(routine.arity as u64).to_le_bytes());
        }
        hasher.digest()
    }
}

fn import_into<S>(
    source: &S,
    module: &ModulePath,
    builder: &mut FunctionTableBuilder,
    report: &mut BuildReport,
) where
    S: ModuleSource + ?Sized,
{
    let exports = match source.import(module) {
        Ok(exports) => exports,
        Err(e) => {
            report.record(Diagnostic::ImportFailed {
                module: module.to_string(),
                error: format!("{:#}", e),
            });
            return;
        }
    };

    for routine in exports.into_iter().filter_map(|export| export.routine) {
        let routine = routine.with_origin(module.as_str());
        if let Some(collision) = builder.insert(routine) {
            report.record(collision);
        }
    }
    report.imported.push(module.to_string());
}
