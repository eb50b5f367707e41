//! Dispatch protocol
//!
//! The only thing that crosses the wire is a dispatch id: the coordinator
//! broadcasts the id of each tagged routine it is about to run, and every
//! worker runs the routine with the same id from its own table. The session
//! ends with [`SENTINEL`].
//!
//! Worker invocations receive `Default::default()` for every declared
//! parameter. A routine that needs the coordinator's data fetches it inside
//! its body with [`Context::share`].

use std::cell::Cell;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::comm::{Communicator, CommunicatorExt, Rank, Role, COORDINATOR_RANK};
use crate::core::errors::{LockstepError, Result};
use crate::registry::{FunctionTable, ParallelRoutine};
use crate::session::SessionState;

/// Integer standing in for a routine name on the wire
pub type DispatchId = i64;

/// Reserved id that ends the session
pub const SENTINEL: DispatchId = -1;

/// A rank's view of the running session, handed to every routine
pub struct Context<'a> {
    comm: &'a dyn Communicator,
    table: &'a FunctionTable,
    depth: Cell<u32>,
    dispatched: Cell<u64>,
    state: Cell<SessionState>,
}

impl<'a> Context<'a> {
    pub fn new(comm: &'a dyn Communicator, table: &'a FunctionTable) -> Self {
        Self {
            comm,
            table,
            depth: Cell::new(0),
            dispatched: Cell::new(0),
            state: Cell::new(SessionState::Running),
        }
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn role(&self) -> Role {
        self.comm.role()
    }

    pub fn is_coordinator(&self) -> bool {
        self.role() == Role::Coordinator
    }

    pub fn table(&self) -> &FunctionTable {
        self.table
    }

    /// Routines announced (coordinator) or run (worker) so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched.get()
    }

    /// `Running` until the sentinel is sent (coordinator) or received
    /// (worker), then `Terminating`
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// True while a dispatched routine is executing
    pub fn in_routine(&self) -> bool {
        self.depth.get() > 0
    }

    /// Broadcast the coordinator's `value` to every rank
    pub fn share<T>(&self, value: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.broadcast(value, COORDINATOR_RANK)
    }

    /// Broadcast `value` from `root` to every rank
    pub fn broadcast<T>(&self, value: T, root: Rank) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Ok(self.comm.broadcast(value, root)?)
    }

    /// Dispatch wrapper: what a `#[parallel]` function does when called.
    ///
    /// On the coordinator at top level, broadcast `name`'s id and then run
    /// `body`. Inside a running routine, every rank is already executing the
    /// caller, so `body` runs inline without an announcement.
    pub fn enter<R>(&self, name: &str, body: impl FnOnce(&Self) -> R) -> Result<R> {
        if !self.in_routine() {
            match self.role() {
                Role::Coordinator => {
                    let id = self.table.id_of(name).ok_or_else(|| {
                        LockstepError::UnknownRoutine {
                            name: name.to_string(),
                        }
                    })?;
                    self.announce(id)?;
                    debug!(routine = name, id, "announced");
                }
                Role::Worker => {
                    return Err(LockstepError::WrapperOnWorker {
                        name: name.to_string(),
                        rank: self.rank(),
                    })
                }
            }
        }
        Ok(self.nested(body))
    }

    fn nested<R>(&self, body: impl FnOnce(&Self) -> R) -> R {
        struct Depth<'c>(&'c Cell<u32>);
        impl Drop for Depth<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() - 1);
            }
        }

        self.depth.set(self.depth.get() + 1);
        let _guard = Depth(&self.depth);
        body(self)
    }

    fn announce(&self, id: DispatchId) -> Result<()> {
        self.comm.broadcast(id, COORDINATOR_RANK)?;
        if id != SENTINEL {
            self.dispatched.set(self.dispatched.get() + 1);
        }
        Ok(())
    }

    /// Tell every worker the session is over
    pub(crate) fn finish(&self) -> Result<()> {
        debug!("announcing sentinel");
        self.announce(SENTINEL)?;
        self.advance(SessionState::Terminating)
    }

    fn advance(&self, to: SessionState) -> Result<()> {
        let mut state = self.state.get();
        state.transition(to)?;
        self.state.set(state);
        Ok(())
    }

    fn receive_id(&self) -> Result<DispatchId> {
        Ok(self.comm.broadcast(SENTINEL, COORDINATOR_RANK)?)
    }

    fn invoke(&self, routine: &ParallelRoutine) -> Result<()> {
        self.nested(|ctx| routine.call(ctx))
            .map_err(|e| LockstepError::routine_failed(routine.name(), e))?;
        self.dispatched.set(self.dispatched.get() + 1);
        Ok(())
    }
}

/// Worker side of the protocol: run routines by id until the sentinel.
///
/// Returns the number of routines run. An id missing from the table is
/// fatal; nothing further is received or looked up.
pub fn dispatch_loop(ctx: &Context<'_>) -> Result<u64> {
    let mut runs = 0;
    loop {
        let id = ctx.receive_id()?;
        if id == SENTINEL {
            debug!(runs, "sentinel received");
            ctx.advance(SessionState::Terminating)?;
            return Ok(runs);
        }

        let Some(routine) = ctx.table.get(id) else {
            error!(id, table_len = ctx.table.len(), "unknown dispatch id");
            return Err(LockstepError::UnknownDispatchId {
                id,
                table_len: ctx.table.len(),
            });
        };

        debug!(routine = routine.name(), id, "dispatching");
        ctx.invoke(routine)?;
        runs += 1;
    }
}
