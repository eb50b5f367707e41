//! End-to-end sessions over an in-process group.

use lockstep::{
    parallel, Communicator, Context, FunctionTable, LocalGroup, LockstepError, ParallelRoutine,
    Role, Session, SessionConfig, SessionState, PARALLEL_ROUTINES,
};
use pretty_assertions::assert_eq;

const GROUP_SIZE: usize = 4;

/// Every rank sums the coordinator's data, then all ranks exchange their sums.
#[parallel]
fn gather_sums(ctx: &Context, data: Vec<u64>) -> anyhow::Result<Vec<u64>> {
    let data = ctx.share(data)?;
    let local: u64 = data.iter().sum();
    let mut sums = Vec::with_capacity(ctx.size());
    for root in 0..ctx.size() {
        sums.push(ctx.broadcast(local, root)?);
    }
    Ok(sums)
}

/// Calls another tagged routine from inside its body.
#[parallel]
fn scaled_sums(ctx: &Context, factor: u64) -> anyhow::Result<Vec<u64>> {
    let factor = ctx.share(factor)?;
    let sums = gather_sums(ctx, vec![1, 2, 3])?;
    Ok(sums.into_iter().map(|s| s * factor).collect())
}

#[parallel(name = "ranks_agree")]
fn check_ranks(ctx: &Context) -> Result<(), LockstepError> {
    let size = ctx.share(ctx.size())?;
    assert_eq!(size, GROUP_SIZE);
    Ok(())
}

fn config() -> SessionConfig {
    SessionConfig::builder().channel_capacity(16).build().unwrap()
}

#[test]
fn test_macro_decls() {
    let arity = |name: &str| {
        PARALLEL_ROUTINES
            .iter()
            .find(|decl| decl.name == name)
            .map(|decl| (decl.arity, decl.module))
    };
    assert_eq!(arity("gather_sums"), Some((1, "test_session")));
    assert_eq!(arity("scaled_sums"), Some((1, "test_session")));
    assert_eq!(arity("ranks_agree"), Some((0, "test_session")));
    assert_eq!(arity("check_ranks"), None);
}

#[test]
fn test_coordinator_drives_every_rank() {
    let results = LocalGroup::run_configured(GROUP_SIZE, &config(), |comm| {
        let session = Session::builder(&comm).config(config()).build()?;
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.table().names(), vec!["gather_sums", "ranks_agree", "scaled_sums"]);

        let mut observed = Vec::new();
        let summary = session.run(|ctx| -> anyhow::Result<()> {
            check_ranks(ctx)?;
            observed.push(gather_sums(ctx, vec![4, 5, 6])?);
            observed.push(scaled_sums(ctx, 10)?);
            Ok(())
        })?;
        Ok::<_, LockstepError>((summary, observed))
    });

    for (rank, result) in results.into_iter().enumerate() {
        let (summary, observed) = result.unwrap().unwrap();
        assert_eq!(summary.rank, rank);
        assert_eq!(summary.final_state, SessionState::Terminated);
        // Nested calls inside scaled_sums are not announced
        assert_eq!(summary.dispatched, 3);

        if summary.role == Role::Coordinator {
            assert_eq!(
                observed,
                vec![vec![15; GROUP_SIZE], vec![60; GROUP_SIZE]]
            );
        } else {
            assert!(observed.is_empty());
        }
    }
}

#[test]
fn test_mismatched_tables_fail_everywhere() {
    let results = LocalGroup::run(3, 8, |comm| {
        let mut names = vec!["solve", "assemble"];
        if comm.rank() == 1 {
            names.push("extra");
        }
        let table = FunctionTable::from_routines(
            names
                .into_iter()
                .map(|name| ParallelRoutine::new(name, 0, |_ctx| Ok(()))),
        );
        Session::builder(&comm).table(table).build().map(|_| ())
    });

    for result in results {
        let err = result.unwrap().unwrap_err();
        assert!(matches!(err, LockstepError::TableMismatch { ref ranks } if ranks == &vec![1]));
        assert!(err.is_fatal());
    }
}

#[test]
fn test_unknown_id_stops_worker() {
    let results = LocalGroup::run(2, 8, |comm| {
        let table = if comm.rank() == 0 {
            FunctionTable::from_routines([ParallelRoutine::new("only_here", 0, |_ctx| Ok(()))])
        } else {
            FunctionTable::default()
        };
        let config = SessionConfig::builder().verify_table(false).build()?;
        let session = Session::builder(&comm).config(config).table(table).build()?;
        session.run(|ctx| ctx.enter("only_here", |_| ()))
    });

    let mut results = results.into_iter();
    // The coordinator may or may not see the worker leave before its sentinel.
    let _coordinator = results.next().unwrap().unwrap();
    let worker = results.next().unwrap().unwrap();
    assert!(matches!(
        worker,
        Err(LockstepError::UnknownDispatchId { id: 0, table_len: 0 })
    ));
}

#[test]
fn test_routine_failure_on_worker() {
    let results = LocalGroup::run(2, 8, |comm| {
        let fail_here = comm.rank() == 1;
        let table = FunctionTable::from_routines([ParallelRoutine::new("flaky", 0, move |_ctx| {
            if fail_here {
                anyhow::bail!("worker-only failure");
            }
            Ok(())
        })]);
        let session = Session::builder(&comm).table(table).build()?;
        session.run(|ctx| ctx.enter("flaky", |_| ()))
    });

    let worker = results.into_iter().nth(1).unwrap().unwrap();
    match worker {
        Err(LockstepError::RoutineFailed { name, source }) => {
            assert_eq!(name, "flaky");
            assert_eq!(source.to_string(), "worker-only failure");
        }
        other => panic!("expected RoutineFailed, got {:?}", other),
    }
}
