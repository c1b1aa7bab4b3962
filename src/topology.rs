//! Organizing processes as groups and communicators
//!
//! Processes are organized in communicators: fixed, ordered sets of
//! cooperating processes. Every process is addressed via its `Rank` within a
//! communicator. This crate does not manage group lifecycle itself; instead,
//! the [`Communicator`] trait is the narrow interface through which an
//! external communication layer supplies group size, the local rank, and the
//! point-to-point primitives the collective patterns are composed from.
//!
//! A [`Process`] identifies one rank within a communicator and is how a
//! process takes the 'root' role in rooted collective operations.

use crate::error::{Error, Result};
use crate::Tag;

/// Identifies a certain process within a communicator.
pub type Rank = i32;

/// Something that has a communicator associated with it
pub trait AsCommunicator {
    /// The type of the associated communicator
    type Out: Communicator;
    /// Returns the associated communicator.
    fn as_communicator(&self) -> &Self::Out;
}

/// The oracle a collective operation runs over: group shape plus the
/// transport primitives used to move payloads between ranks.
///
/// Implementations must deliver payloads byte-exact and, per ordered
/// `(source, destination, tag)` triple, in the order issued. [`send`] must
/// be buffered: it may not require the matching [`receive`] to already be
/// posted, otherwise the linear exchange schedules used by the collective
/// patterns can deadlock.
///
/// [`send`]: Communicator::send
/// [`receive`]: Communicator::receive
pub trait Communicator {
    /// Number of processes in the group.
    fn size(&self) -> Rank;

    /// The local process's rank, in `[0, size)`.
    fn rank(&self) -> Rank;

    /// Deliver `payload` to `destination`.
    fn send(&self, destination: Rank, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Block until a payload with `tag` arrives from `source` and return it.
    fn receive(&self, source: Rank, tag: Tag) -> Result<Vec<u8>>;

    /// Whether the transport supports the exclusive prefix reduction.
    ///
    /// Dispatch surfaces [`Error::Unsupported`](crate::Error::Unsupported)
    /// from `exclusive_scan_into` when this returns `false`.
    fn supports_exclusive_scan(&self) -> bool {
        true
    }

    /// Identifies the process at `rank` within this communicator.
    ///
    /// # Panics
    ///
    /// Panics when `rank` is outside `[0, size)`. Use
    /// [`process_at_rank_checked`](Communicator::process_at_rank_checked)
    /// to report an out-of-range root as an error instead.
    fn process_at_rank(&self, rank: Rank) -> Process<'_, Self>
    where
        Self: Sized,
    {
        assert!(
            0 <= rank && rank < self.size(),
            "rank {} is not a member of a group of size {}",
            rank,
            self.size()
        );
        Process { comm: self, rank }
    }

    /// Identifies the process at `rank`, or fails with
    /// [`Error::InvalidRoot`] when `rank` is outside the group.
    fn process_at_rank_checked(&self, rank: Rank) -> Result<Process<'_, Self>>
    where
        Self: Sized,
    {
        if 0 <= rank && rank < self.size() {
            Ok(Process { comm: self, rank })
        } else {
            Err(Error::InvalidRoot {
                root: rank,
                size: self.size(),
            })
        }
    }

    /// The [`Process`] for the local rank.
    fn this_process(&self) -> Process<'_, Self>
    where
        Self: Sized,
    {
        Process {
            comm: self,
            rank: self.rank(),
        }
    }
}

/// Identifies a process by its `Rank` within a certain communicator.
#[derive(Copy, Clone)]
pub struct Process<'a, C: 'a + Communicator> {
    comm: &'a C,
    rank: Rank,
}

impl<'a, C: 'a + Communicator> Process<'a, C> {
    /// The rank of the identified process.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Whether this process is the local process.
    pub fn is_self(&self) -> bool {
        self.rank == self.comm.rank()
    }
}

impl<'a, C: 'a + Communicator> AsCommunicator for Process<'a, C> {
    type Out = C;
    fn as_communicator(&self) -> &Self::Out {
        self.comm
    }
}
