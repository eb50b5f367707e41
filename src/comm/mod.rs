//! Group communication seam
//!
//! The dispatch protocol only needs a rank query and a synchronous broadcast.
//! Anything that can provide those (an MPI communicator, a socket mesh, the
//! in-process [`LocalGroup`]) can drive a session.

pub mod local;

pub use local::{LocalCommunicator, LocalGroup};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::errors::CommError;

/// A process's integer identity within its group
pub type Rank = usize;

/// Rank that drives the session
pub const COORDINATOR_RANK: Rank = 0;

/// Role of a process, fixed for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    pub fn of(rank: Rank) -> Self {
        if rank == COORDINATOR_RANK {
            Role::Coordinator
        } else {
            Role::Worker
        }
    }
}

/// Synchronous collective channel shared by every member of a group.
///
/// All members must call [`broadcast_bytes`](Communicator::broadcast_bytes)
/// the same number of times, in the same order, with the same root.
pub trait Communicator {
    /// This member's rank
    fn rank(&self) -> Rank;

    /// Number of members in the group
    fn size(&self) -> usize;

    /// Deliver `payload` from `root` to every member and return it.
    ///
    /// Non-root members pass an empty payload; their input is ignored.
    fn broadcast_bytes(&self, payload: Vec<u8>, root: Rank) -> Result<Vec<u8>, CommError>;

    fn role(&self) -> Role {
        Role::of(self.rank())
    }
}

/// Typed broadcasts on top of [`Communicator`]
pub trait CommunicatorExt: Communicator {
    /// Broadcast `value` from `root`. Every member gets the root's value back;
    /// the values passed by other members are never encoded.
    fn broadcast<T>(&self, value: T, root: Rank) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = if self.rank() == root {
            bincode::serialize(&value)?
        } else {
            Vec::new()
        };
        let bytes = self.broadcast_bytes(payload, root)?;
        if self.rank() == root {
            return Ok(value);
        }
        Ok(bincode::deserialize(&bytes)?)
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

impl<C: Communicator + ?Sized> Communicator for &C {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn broadcast_bytes(&self, payload: Vec<u8>, root: Rank) -> Result<Vec<u8>, CommError> {
        (**self).broadcast_bytes(payload, root)
    }
}
