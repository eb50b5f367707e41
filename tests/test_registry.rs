//! Function table construction from scanned module trees.
//!
//! Each build stands in for one process: ranks that see the same modules
//! must end up with the same ids.

use lockstep::{
    Diagnostic, Export, FunctionTable, InMemorySource, ModulePath, ParallelRoutine, Scanner,
};
use pretty_assertions::assert_eq;

fn tagged(name: &str) -> Export {
    Export::tagged(ParallelRoutine::new(name, 0, |_ctx| Ok(())))
}

fn app_source() -> InMemorySource {
    InMemorySource::new()
        .module(
            "app",
            "#[parallel] fn foo\n#[parallel] fn bar\nfn baz",
            vec![tagged("foo"), tagged("bar"), Export::plain("baz")],
        )
        .module("app::util", "fn helper", vec![Export::plain("helper")])
}

#[test]
fn test_sorted_ids_independent_of_discovery_order() {
    let first = InMemorySource::new().module(
        "m",
        "#[parallel]",
        vec![tagged("alpha"), tagged("gamma"), tagged("beta")],
    );
    let second = InMemorySource::new()
        .module("m", "#[parallel]", vec![tagged("gamma")])
        .module("m::x", "#[parallel]", vec![tagged("beta"), tagged("alpha")]);

    let scanner = Scanner::new(["m"]);
    let (a, _) = FunctionTable::discover(&first, &scanner);
    let (b, _) = FunctionTable::discover(&second, &scanner);

    let expected = vec![
        ("alpha".to_string(), 0),
        ("beta".to_string(), 1),
        ("gamma".to_string(), 2),
    ];
    assert_eq!(a.assignments(), expected);
    assert_eq!(b.assignments(), expected);
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn test_only_tagged_routines_are_collected() {
    let (table, report) = FunctionTable::discover(&app_source(), &Scanner::new(["app"]));
    assert_eq!(table.names(), vec!["bar", "foo"]);
    assert!(table.by_name("baz").is_none());
    assert!(table.by_name("helper").is_none());
    assert!(report.is_clean());
    assert_eq!(report.imported, vec!["app".to_string(), "app::util".to_string()]);
}

#[test]
fn test_rebuild_is_identical() {
    let source = app_source();
    let scanner = Scanner::new(["app"]);
    let (once, _) = FunctionTable::discover(&source, &scanner);
    let (twice, _) = FunctionTable::discover(&source, &scanner);
    assert_eq!(once.assignments(), twice.assignments());
    assert_eq!(once.fingerprint(), twice.fingerprint());
}

#[test]
fn test_marker_filter_avoids_imports() {
    let source = app_source().broken("app::legacy", "no tags here", "would panic on import");
    let scanner = Scanner::new(["app"]).with_marker(Some(lockstep::DEFAULT_MARKER.to_string()));
    let (table, report) = FunctionTable::discover(&source, &scanner);

    assert_eq!(table.names(), vec!["bar", "foo"]);
    assert!(report.is_clean());
    assert_eq!(
        report.skipped,
        vec!["app::legacy".to_string(), "app::util".to_string()]
    );
}

#[test]
fn test_collision_keeps_later_module() {
    let source = InMemorySource::new()
        .module("app::a", "#[parallel]", vec![tagged("dup"), tagged("only_a")])
        .module("app::b", "#[parallel]", vec![tagged("dup")]);
    let (table, report) = FunctionTable::discover(&source, &Scanner::new(["app"]));

    assert_eq!(table.names(), vec!["dup", "only_a"]);
    assert_eq!(table.by_name("dup").unwrap().origin(), "app::b");
    assert_eq!(
        report.diagnostics,
        vec![Diagnostic::NameCollision {
            name: "dup".to_string(),
            kept: "app::b".to_string(),
            replaced: "app::a".to_string(),
        }]
    );
}

#[test]
fn test_import_failure_is_reported() {
    let source = app_source().broken("app::io", "#[parallel] fn dump", "missing libhdf5");
    let (table, report) = FunctionTable::discover(&source, &Scanner::new(["app", "ghost"]));

    assert_eq!(table.names(), vec!["bar", "foo"]);
    assert!(!report.is_clean());
    assert_eq!(
        report.diagnostics,
        vec![
            Diagnostic::ImportFailed {
                module: "app::io".to_string(),
                error: "missing libhdf5".to_string(),
            },
            Diagnostic::MissingRoot {
                root: "ghost".to_string()
            },
        ]
    );

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["diagnostics"][0]["kind"], "import_failed");
    assert_eq!(json["diagnostics"][1]["kind"], "missing_root");
}

#[test]
fn test_build_from_explicit_module_list() {
    let source = app_source();
    let modules = [ModulePath::new("app::util"), ModulePath::new("app")];
    let (table, report) = FunctionTable::build(&source, modules);
    assert_eq!(table.names(), vec!["bar", "foo"]);
    assert_eq!(report.imported, vec!["app::util".to_string(), "app".to_string()]);
}
