//! Session lifecycle: build the table, agree on it, branch by role.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span};

use crate::comm::{Communicator, CommunicatorExt, Rank, Role, COORDINATOR_RANK};
use crate::core::config::SessionConfig;
use crate::core::errors::{LockstepError, Result};
use crate::dispatch::{dispatch_loop, Context};
use crate::registry::{BuildReport, FunctionTable};
use crate::scan::{LinkedSource, ModuleSource, Scanner};

/// Lifecycle of a session. States are visited in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Initializing,
    Running,
    Terminating,
    Terminated,
}

impl SessionState {
    /// The only state reachable from this one
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Initializing => Some(Self::Running),
            Self::Running => Some(Self::Terminating),
            Self::Terminating => Some(Self::Terminated),
            Self::Terminated => None,
        }
    }

    /// Move to `to`, refusing to skip or revisit a state
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if self.next() != Some(to) {
            return Err(LockstepError::InvalidTransition { from: *self, to });
        }
        debug!(from = ?*self, ?to, "session transition");
        *self = to;
        Ok(())
    }
}

/// Outcome of [`Session::run`] on one rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub rank: Rank,
    pub role: Role,
    /// Routines announced (coordinator) or run (worker)
    pub dispatched: u64,
    pub final_state: SessionState,
    pub table_len: usize,
    pub fingerprint: u64,
}

/// One rank's participation in a dispatch session
pub struct Session<C: Communicator> {
    comm: C,
    table: FunctionTable,
    config: SessionConfig,
    report: BuildReport,
    state: SessionState,
}

impl<C: Communicator> Session<C> {
    pub fn builder<'s>(comm: C) -> SessionBuilder<'s, C> {
        SessionBuilder::new(comm)
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn role(&self) -> Role {
        self.comm.role()
    }

    pub fn table(&self) -> &FunctionTable {
        &self.table
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion.
    ///
    /// The coordinator runs `driver`, discards what it returns, then sends
    /// the sentinel. Workers ignore `driver` and serve dispatches until the
    /// sentinel arrives.
    pub fn run<F, R>(mut self, driver: F) -> Result<SessionSummary>
    where
        F: FnOnce(&Context<'_>) -> R,
    {
        let rank = self.rank();
        let role = self.role();
        let span = info_span!("session", rank, role = ?role);
        let _enter = span.enter();

        info!(table_len = self.table.len(), "session running");
        let ctx = Context::new(&self.comm, &self.table);

        let result = match role {
            Role::Coordinator => {
                let _ = driver(&ctx);
                ctx.finish()
            }
            Role::Worker => dispatch_loop(&ctx).map(|_| ()),
        };
        if let Err(e) = result {
            error!(error = %e, category = e.category(), "session aborted");
            return Err(e);
        }

        // The sentinel moved the context to Terminating
        self.state = ctx.state();
        self.state.transition(SessionState::Terminated)?;

        let summary = SessionSummary {
            rank,
            role,
            dispatched: ctx.dispatched(),
            final_state: self.state,
            table_len: self.table.len(),
            fingerprint: self.table.fingerprint(),
        };
        info!(dispatched = summary.dispatched, "session terminated");
        Ok(summary)
    }
}

/// Assembles a [`Session`]; see [`Session::builder`]
pub struct SessionBuilder<'s, C: Communicator> {
    comm: C,
    config: SessionConfig,
    table: Option<FunctionTable>,
    source: Option<&'s dyn ModuleSource>,
}

impl<'s, C: Communicator> SessionBuilder<'s, C> {
    pub fn new(comm: C) -> Self {
        Self {
            comm,
            config: SessionConfig::default(),
            table: None,
            source: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an explicitly registered table; no scanning happens
    pub fn table(mut self, table: FunctionTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Discover the table in `source` from the configured roots and marker
    pub fn source(mut self, source: &'s dyn ModuleSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Build the table, verify it across the group if configured, and move
    /// the session to `Running`.
    ///
    /// Without an explicit table or source, every linked `#[parallel]`
    /// routine is used, limited to the configured roots if there are any.
    pub fn build(self) -> Result<Session<C>> {
        self.config.validate()?;
        let mut state = SessionState::Initializing;

        let (table, report) = match (self.table, self.source) {
            (Some(table), _) => (table, BuildReport::default()),
            (None, Some(source)) => {
                FunctionTable::discover(source, &Scanner::from_config(&self.config))
            }
            (None, None) if !self.config.roots.is_empty() => {
                // Linked modules have no source text to hold a marker.
                let scanner = Scanner::from_config(&self.config).with_marker(None);
                FunctionTable::discover(&LinkedSource::new(), &scanner)
            }
            (None, None) => (FunctionTable::linked(), BuildReport::default()),
        };
        info!(
            rank = self.comm.rank(),
            routines = table.len(),
            diagnostics = report.diagnostics.len(),
            fingerprint = table.fingerprint(),
            "function table built"
        );

        if self.config.verify_table {
            verify_table(&self.comm, &table)?;
        }
        state.transition(SessionState::Running)?;

        Ok(Session {
            comm: self.comm,
            table,
            config: self.config,
            report,
            state,
        })
    }
}

/// Check that every rank holds the coordinator's table.
///
/// The coordinator broadcasts its fingerprint, then each rank broadcasts its
/// verdict in rank order, so every rank learns the full set of mismatched
/// ranks and fails the same way.
pub fn verify_table<C>(comm: &C, table: &FunctionTable) -> Result<()>
where
    C: Communicator + ?Sized,
{
    let local = table.fingerprint();
    let expected: u64 = comm.broadcast(local, COORDINATOR_RANK)?;
    let agrees = expected == local;

    let mut mismatched = Vec::new();
    for root in 0..comm.size() {
        let verdict: bool = comm.broadcast(agrees, root)?;
        if !verdict {
            mismatched.push(root);
        }
    }

    if mismatched.is_empty() {
        debug!(fingerprint = local, "function table verified");
        return Ok(());
    }
    error!(
        ranks = ?mismatched,
        expected,
        local,
        "function table differs across the group"
    );
    Err(LockstepError::TableMismatch { ranks: mismatched })
}
