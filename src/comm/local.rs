//! In-process group: N members on N threads sharing one broadcast channel.
//!
//! Every frame is delivered to every member, the root included, so all
//! members observe one total order. Frames carry the sender's sequence
//! number and root rank; a member that receives anything other than the
//! frame it expects fails with [`CommError`] instead of silently consuming
//! the wrong value.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use async_broadcast::{broadcast, Receiver, RecvError, Sender};
use tracing::trace;

use super::{Communicator, Rank};
use crate::core::config::SessionConfig;
use crate::core::errors::CommError;

#[derive(Clone, Debug)]
struct Frame {
    seq: u64,
    root: Rank,
    payload: Arc<Vec<u8>>,
}

/// Factory for the members of an in-process group
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` connected members, indexed by rank.
    ///
    /// `capacity` bounds the frames buffered ahead of the slowest member; a
    /// root that gets that far ahead blocks.
    pub fn new(size: usize, capacity: usize) -> Vec<LocalCommunicator> {
        let (tx, rx) = broadcast::<Frame>(capacity.max(1));
        (0..size)
            .map(|rank| LocalCommunicator {
                rank,
                size,
                seq: Cell::new(0),
                tx: tx.clone(),
                rx: RefCell::new(rx.clone()),
            })
            .collect()
    }

    /// Run `body` once per rank, each on its own thread, and collect the
    /// results in rank order.
    pub fn run<F, R>(size: usize, capacity: usize, body: F) -> Vec<std::thread::Result<R>>
    where
        F: Fn(LocalCommunicator) -> R + Send + Sync,
        R: Send,
    {
        let members = Self::new(size, capacity);
        let body = &body;
        std::thread::scope(|scope| {
            let handles: Vec<_> = members
                .into_iter()
                .map(|comm| scope.spawn(move || body(comm)))
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        })
    }

    /// [`LocalGroup::run`] with the buffer size taken from
    /// `config.channel_capacity`
    pub fn run_configured<F, R>(
        size: usize,
        config: &SessionConfig,
        body: F,
    ) -> Vec<std::thread::Result<R>>
    where
        F: Fn(LocalCommunicator) -> R + Send + Sync,
        R: Send,
    {
        Self::run(size, config.channel_capacity, body)
    }
}

/// One member of a [`LocalGroup`]
pub struct LocalCommunicator {
    rank: Rank,
    size: usize,
    seq: Cell<u64>,
    tx: Sender<Frame>,
    rx: RefCell<Receiver<Frame>>,
}

impl LocalCommunicator {
    /// Number of broadcasts this member has completed
    pub fn sequence(&self) -> u64 {
        self.seq.get()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bytes(&self, payload: Vec<u8>, root: Rank) -> Result<Vec<u8>, CommError> {
        if root >= self.size {
            return Err(CommError::InvalidRoot {
                root,
                size: self.size,
            });
        }

        let expected_seq = self.seq.get();
        if root == self.rank {
            let frame = Frame {
                seq: expected_seq,
                root,
                payload: Arc::new(payload),
            };
            self.tx
                .broadcast_blocking(frame)
                .map_err(|_| CommError::Disconnected)?;
        }

        let frame = match self.rx.borrow_mut().recv_blocking() {
            Ok(frame) => frame,
            Err(RecvError::Closed) => return Err(CommError::Disconnected),
            Err(RecvError::Overflowed(skipped)) => {
                return Err(CommError::Desync {
                    expected_seq,
                    got_seq: expected_seq + skipped,
                })
            }
        };

        if frame.seq != expected_seq {
            return Err(CommError::Desync {
                expected_seq,
                got_seq: frame.seq,
            });
        }
        if frame.root != root {
            return Err(CommError::RootMismatch {
                expected: root,
                got: frame.root,
            });
        }

        self.seq.set(expected_seq + 1);
        trace!(rank = self.rank, root, seq = expected_seq, "broadcast complete");
        Ok(Arc::try_unwrap(frame.payload).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl Drop for LocalCommunicator {
    /// A member leaving closes the channel for everyone. Frames already sent
    /// can still be received, so members that finished the protocol are
    /// unaffected; members still waiting for more get `Disconnected`
    /// instead of blocking forever.
    fn drop(&mut self) {
        self.tx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommunicatorExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_broadcast_reaches_every_rank() {
        let results = LocalGroup::run(4, 8, |comm| {
            let value = if comm.rank() == 0 { vec![1.5, 2.5] } else { Vec::new() };
            let got: Vec<f64> = comm.broadcast(value, 0).unwrap();
            let from_last: u32 = comm.broadcast(comm.rank() as u32 * 10, 3).unwrap();
            (got, from_last, comm.sequence())
        });

        for result in results {
            let (got, from_last, seq) = result.unwrap();
            assert_eq!(got, vec![1.5, 2.5]);
            assert_eq!(from_last, 30);
            assert_eq!(seq, 2);
        }
    }

    #[test]
    fn test_single_frame_buffer_keeps_order() {
        let config = SessionConfig::builder().channel_capacity(1).build().unwrap();
        let results = LocalGroup::run_configured(3, &config, |comm| {
            (0..20u32)
                .map(|i| {
                    let value = if comm.rank() == 0 { i } else { 0 };
                    comm.broadcast(value, 0).unwrap()
                })
                .collect::<Vec<u32>>()
        });

        for result in results {
            assert_eq!(result.unwrap(), (0..20).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn test_invalid_root() {
        let members = LocalGroup::new(2, 4);
        let err = members[0].broadcast_bytes(vec![1], 2).unwrap_err();
        assert!(matches!(err, CommError::InvalidRoot { root: 2, size: 2 }));
    }

    #[test]
    fn test_conflicting_roots_are_detected() {
        let members = LocalGroup::new(2, 4);

        // Rank 0 completes a broadcast it roots.
        assert_eq!(members[0].broadcast_bytes(vec![7], 0).unwrap(), vec![7]);

        // Rank 1 believes it is root for the same step and sees rank 0's frame.
        let err = members[1].broadcast_bytes(vec![9], 1).unwrap_err();
        assert!(matches!(err, CommError::RootMismatch { expected: 1, got: 0 }));

        // Rank 0 moves on and finds rank 1's stray frame from step 0.
        let err = members[0].broadcast_bytes(vec![8], 0).unwrap_err();
        assert!(matches!(
            err,
            CommError::Desync {
                expected_seq: 1,
                got_seq: 0
            }
        ));
    }

    #[test]
    fn test_departed_member_disconnects_waiters() {
        let mut members = LocalGroup::new(2, 4);
        let waiter = members.pop().unwrap();
        drop(members);

        let err = waiter.broadcast_bytes(Vec::new(), 0).unwrap_err();
        assert!(matches!(err, CommError::Disconnected));
    }
}
