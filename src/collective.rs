//! Collective communication patterns
//!
//! Patterns that involve all processes of a group are provided on
//! [`CommunicatorCollectives`]; patterns distinguished by a root process are
//! provided on [`Root`], obtained from
//! [`Communicator::process_at_rank()`](crate::topology::Communicator::process_at_rank).
//!
//! All local validation (element-type and count agreement, operation
//! liveness, capacity relations) happens before the first transport call.
//! Disagreement between ranks that only becomes observable at exchange time
//! surfaces as [`Error::LengthMismatch`] on the received payload.
//!
//! The schedules are linear and rely on the oracle's buffered-send
//! contract: fan-in/fan-out at the root for the rooted patterns, a full
//! pairwise exchange for all-gather and all-to-all, a fold at rank zero
//! followed by a broadcast for all-reduce, and a rank chain carrying the
//! inclusive prefix for the scans. Reduction folds always combine
//! contributions in ascending rank order, so non-commutative operations see
//! a deterministic operand order.

use log::trace;

use crate::datatype::{Buffer, BufferMut, ElementType, Partition, PartitionMut};
use crate::error::{Error, Result};
use crate::operation::{reduce_packed, Op, Operation};
use crate::topology::{AsCommunicator, Communicator, Process, Rank};
use crate::{Count, Tag};

/// Tags at or above this value are reserved for the collective phases.
/// User point-to-point traffic must stay below it.
pub const RESERVED_TAG_BASE: Tag = 0x7a00_0000;

const BARRIER_TAG: Tag = RESERVED_TAG_BASE;
const BROADCAST_TAG: Tag = RESERVED_TAG_BASE + 1;
const GATHER_TAG: Tag = RESERVED_TAG_BASE + 2;
const SCATTER_TAG: Tag = RESERVED_TAG_BASE + 3;
const ALL_GATHER_TAG: Tag = RESERVED_TAG_BASE + 4;
const ALL_TO_ALL_TAG: Tag = RESERVED_TAG_BASE + 5;
const REDUCE_TAG: Tag = RESERVED_TAG_BASE + 6;
const ALL_REDUCE_TAG: Tag = RESERVED_TAG_BASE + 7;
const SCAN_TAG: Tag = RESERVED_TAG_BASE + 8;
const EXSCAN_TAG: Tag = RESERVED_TAG_BASE + 9;

/// A process's own part of an exchange: either a packed payload or already
/// resident in the destination region.
enum Contribution {
    Packed(Vec<u8>),
    InPlace,
}

fn receive_expected<C: Communicator + ?Sized>(
    comm: &C,
    source: Rank,
    tag: Tag,
    expected: usize,
) -> Result<Vec<u8>> {
    let payload = comm.receive(source, tag)?;
    if payload.len() != expected {
        return Err(Error::LengthMismatch {
            expected,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

fn check_same_type<S, R>(sendbuf: &S, recvbuf: &R) -> Result<()>
where
    S: Buffer + ?Sized,
    R: Buffer + ?Sized,
{
    if sendbuf.element_type() != recvbuf.element_type() {
        return Err(Error::InvalidArgument(
            "send and receive buffers have different element types",
        ));
    }
    Ok(())
}

/// Splits `packed` into `parts` equal segments and returns segment `index`.
fn segment(packed: &[u8], parts: usize, index: usize) -> &[u8] {
    let extent = packed.len() / parts;
    &packed[index * extent..(index + 1) * extent]
}

/// Gathers one equal-sized contribution per rank at the root, in rank
/// order.
fn gather_fan_in<C: Communicator + ?Sized>(
    comm: &C,
    root: Rank,
    tag: Tag,
    contribution: Contribution,
    gathered: &mut [u8],
) -> Result<()> {
    let size = comm.size();
    let extent = gathered.len() / size as usize;
    if let Contribution::Packed(payload) = contribution {
        if payload.len() != extent {
            return Err(Error::LengthMismatch {
                expected: extent,
                actual: payload.len(),
            });
        }
        let at = root as usize * extent;
        gathered[at..at + extent].copy_from_slice(&payload);
    }
    for rank in 0..size {
        if rank == root {
            continue;
        }
        let payload = receive_expected(comm, rank, tag, extent)?;
        let at = rank as usize * extent;
        gathered[at..at + extent].copy_from_slice(&payload);
    }
    Ok(())
}

/// Folds the per-rank segments of `gathered` in ascending rank order,
/// returning the accumulated result.
fn fold_ascending<C: Communicator + ?Sized>(
    comm: &C,
    gathered: &[u8],
    element_type: ElementType,
    count: Count,
    op: Op,
) -> Result<Vec<u8>> {
    let size = comm.size() as usize;
    let mut accumulated = segment(gathered, size, 0).to_vec();
    for rank in 1..size {
        let mut contribution = segment(gathered, size, rank).to_vec();
        reduce_packed(&accumulated, &mut contribution, element_type, count, op)?;
        accumulated = contribution;
    }
    Ok(accumulated)
}

/// Exchanges one equal-sized contribution per rank so every process ends
/// up with all contributions in rank order.
fn all_gather_packed<C: Communicator + ?Sized>(
    comm: &C,
    contribution: Contribution,
    gathered: &mut [u8],
) -> Result<()> {
    let size = comm.size();
    let rank = comm.rank();
    let extent = gathered.len() / size as usize;
    match contribution {
        Contribution::Packed(payload) => {
            for peer in 0..size {
                if peer != rank {
                    comm.send(peer, ALL_GATHER_TAG, &payload)?;
                }
            }
            let at = rank as usize * extent;
            gathered[at..at + extent].copy_from_slice(&payload);
        }
        Contribution::InPlace => {
            let at = rank as usize * extent;
            let own = gathered[at..at + extent].to_vec();
            for peer in 0..size {
                if peer != rank {
                    comm.send(peer, ALL_GATHER_TAG, &own)?;
                }
            }
        }
    }
    for peer in 0..size {
        if peer == rank {
            continue;
        }
        let payload = receive_expected(comm, peer, ALL_GATHER_TAG, extent)?;
        let at = peer as usize * extent;
        gathered[at..at + extent].copy_from_slice(&payload);
    }
    Ok(())
}

/// Folds the group's contributions at rank zero and redistributes the
/// result.
fn all_reduce_packed<C: Communicator + ?Sized>(
    comm: &C,
    contribution: Vec<u8>,
    element_type: ElementType,
    count: Count,
    op: Op,
) -> Result<Vec<u8>> {
    op.validate()?;
    let size = comm.size();
    let rank = comm.rank();
    let extent = contribution.len();
    if rank == 0 {
        let mut gathered = vec![0u8; extent * size as usize];
        gather_fan_in(
            comm,
            0,
            ALL_REDUCE_TAG,
            Contribution::Packed(contribution),
            &mut gathered,
        )?;
        let result = fold_ascending(comm, &gathered, element_type, count, op)?;
        for peer in 1..size {
            comm.send(peer, ALL_REDUCE_TAG, &result)?;
        }
        Ok(result)
    } else {
        comm.send(0, ALL_REDUCE_TAG, &contribution)?;
        receive_expected(comm, 0, ALL_REDUCE_TAG, extent)
    }
}

/// Collective patterns in which all processes of the group play the same
/// role.
pub trait CommunicatorCollectives: Communicator {
    /// Blocks until all processes of the group have entered the barrier.
    fn barrier(&self) -> Result<()> {
        let size = self.size();
        let rank = self.rank();
        trace!("rank {} entering barrier over {} processes", rank, size);
        if rank == 0 {
            for peer in 1..size {
                self.receive(peer, BARRIER_TAG)?;
            }
            for peer in 1..size {
                self.send(peer, BARRIER_TAG, &[])?;
            }
        } else {
            self.send(0, BARRIER_TAG, &[])?;
            self.receive(0, BARRIER_TAG)?;
        }
        Ok(())
    }

    /// Gathers the contents of `sendbuf` from all processes into `recvbuf`
    /// on every process, ordered by rank.
    ///
    /// `recvbuf` must hold `size` times the count of `sendbuf`.
    fn all_gather_into<S, R>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
    {
        check_same_type(sendbuf, recvbuf)?;
        let size = self.size();
        if recvbuf.count() != sendbuf.count() * size {
            return Err(Error::LengthMismatch {
                expected: (sendbuf.count() * size) as usize,
                actual: recvbuf.count() as usize,
            });
        }
        let mut gathered = vec![0u8; recvbuf.byte_extent()];
        all_gather_packed(self, Contribution::Packed(sendbuf.pack()), &mut gathered)?;
        recvbuf.unpack(&gathered)
    }

    /// Gathers in place: on entry each process's own contribution occupies
    /// its rank's segment of `recvbuf`; on exit `recvbuf` holds all
    /// contributions in rank order.
    ///
    /// The count of `recvbuf` must be divisible by the group size.
    fn all_gather_in_place_into<R>(&self, recvbuf: &mut R) -> Result<()>
    where
        R: BufferMut + ?Sized,
    {
        let size = self.size();
        if recvbuf.count() % size != 0 {
            return Err(Error::InvalidArgument(
                "receive count is not divisible by the group size",
            ));
        }
        let mut gathered = recvbuf.pack();
        all_gather_packed(self, Contribution::InPlace, &mut gathered)?;
        recvbuf.unpack(&gathered)
    }

    /// Distributes the per-rank segments of `sendbuf` so that afterwards
    /// segment `i` of `recvbuf` on rank `j` equals segment `j` of
    /// `sendbuf` on rank `i`.
    ///
    /// Both counts must equal the same multiple of the group size.
    fn all_to_all_into<S, R>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
    {
        check_same_type(sendbuf, recvbuf)?;
        let size = self.size();
        let rank = self.rank();
        if sendbuf.count() != recvbuf.count() {
            return Err(Error::LengthMismatch {
                expected: sendbuf.count() as usize,
                actual: recvbuf.count() as usize,
            });
        }
        if sendbuf.count() % size != 0 {
            return Err(Error::InvalidArgument(
                "buffer count is not divisible by the group size",
            ));
        }
        let outgoing = sendbuf.pack();
        let mut incoming = vec![0u8; recvbuf.byte_extent()];
        let extent = outgoing.len() / size as usize;
        for peer in 0..size {
            if peer != rank {
                self.send(peer, ALL_TO_ALL_TAG, segment(&outgoing, size as usize, peer as usize))?;
            }
        }
        let own = rank as usize * extent;
        incoming[own..own + extent]
            .copy_from_slice(segment(&outgoing, size as usize, rank as usize));
        for peer in 0..size {
            if peer == rank {
                continue;
            }
            let payload = receive_expected(self, peer, ALL_TO_ALL_TAG, extent)?;
            let at = peer as usize * extent;
            incoming[at..at + extent].copy_from_slice(&payload);
        }
        recvbuf.unpack(&incoming)
    }

    /// All-to-all with per-rank segment counts described by partitions.
    ///
    /// Both partitions must have exactly one region per rank; the segment
    /// rank `i` sends to rank `j` must have the count rank `j` expects
    /// from rank `i` (violations surface as `LengthMismatch`).
    fn all_to_all_varcount_into<S, R>(
        &self,
        sendbuf: &Partition<'_, S>,
        recvbuf: &mut PartitionMut<'_, R>,
    ) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
    {
        check_same_type(sendbuf.buffer(), recvbuf.buffer())?;
        let size = self.size();
        let rank = self.rank();
        if sendbuf.counts().len() != size as usize || recvbuf.counts().len() != size as usize {
            return Err(Error::InvalidArgument(
                "partition must have one region per rank",
            ));
        }
        let extent = sendbuf.buffer().element_type().extent();
        let outgoing = sendbuf.buffer().pack();
        let mut incoming = vec![0u8; recvbuf.buffer().byte_extent()];

        let mut offset = 0usize;
        let mut send_regions = Vec::with_capacity(size as usize);
        for &count in sendbuf.counts() {
            let bytes = count as usize * extent;
            send_regions.push(offset..offset + bytes);
            offset += bytes;
        }
        let mut offset = 0usize;
        let mut recv_regions = Vec::with_capacity(size as usize);
        for &count in recvbuf.counts() {
            let bytes = count as usize * extent;
            recv_regions.push(offset..offset + bytes);
            offset += bytes;
        }

        for peer in 0..size {
            if peer != rank {
                self.send(
                    peer,
                    ALL_TO_ALL_TAG,
                    &outgoing[send_regions[peer as usize].clone()],
                )?;
            }
        }
        let own_out = send_regions[rank as usize].clone();
        let own_in = recv_regions[rank as usize].clone();
        if own_out.len() != own_in.len() {
            return Err(Error::LengthMismatch {
                expected: own_in.len() / extent,
                actual: own_out.len() / extent,
            });
        }
        incoming[own_in].copy_from_slice(&outgoing[own_out]);
        for peer in 0..size {
            if peer == rank {
                continue;
            }
            let region = recv_regions[peer as usize].clone();
            let payload = receive_expected(self, peer, ALL_TO_ALL_TAG, region.len())?;
            incoming[region].copy_from_slice(&payload);
        }
        recvbuf.buffer_mut().unpack(&incoming)
    }

    /// Reduces `sendbuf` element-wise across all processes with `op`,
    /// leaving the result in `recvbuf` on every process.
    fn all_reduce_into<S, R, O>(&self, sendbuf: &S, recvbuf: &mut R, op: O) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
        O: Operation,
    {
        check_same_type(sendbuf, recvbuf)?;
        if sendbuf.count() != recvbuf.count() {
            return Err(Error::LengthMismatch {
                expected: sendbuf.count() as usize,
                actual: recvbuf.count() as usize,
            });
        }
        let result = all_reduce_packed(
            self,
            sendbuf.pack(),
            recvbuf.element_type(),
            recvbuf.count(),
            op.op(),
        )?;
        recvbuf.unpack(&result)
    }

    /// All-reduce in place: `recvbuf` holds this process's contribution on
    /// entry and the group-wide result on exit.
    fn all_reduce_in_place_into<R, O>(&self, recvbuf: &mut R, op: O) -> Result<()>
    where
        R: BufferMut + ?Sized,
        O: Operation,
    {
        let result = all_reduce_packed(
            self,
            recvbuf.pack(),
            recvbuf.element_type(),
            recvbuf.count(),
            op.op(),
        )?;
        recvbuf.unpack(&result)
    }

    /// Computes the inclusive prefix reduction: `recvbuf` on rank `r`
    /// receives the fold of the contributions of ranks `0..=r` in
    /// ascending order.
    fn scan_into<S, R, O>(&self, sendbuf: &S, recvbuf: &mut R, op: O) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
        O: Operation,
    {
        check_same_type(sendbuf, recvbuf)?;
        if sendbuf.count() != recvbuf.count() {
            return Err(Error::LengthMismatch {
                expected: sendbuf.count() as usize,
                actual: recvbuf.count() as usize,
            });
        }
        let op = op.op();
        op.validate()?;
        let size = self.size();
        let rank = self.rank();
        let mut inclusive = sendbuf.pack();
        if rank > 0 {
            let prefix = receive_expected(self, rank - 1, SCAN_TAG, inclusive.len())?;
            reduce_packed(
                &prefix,
                &mut inclusive,
                recvbuf.element_type(),
                recvbuf.count(),
                op,
            )?;
        }
        if rank + 1 < size {
            self.send(rank + 1, SCAN_TAG, &inclusive)?;
        }
        recvbuf.unpack(&inclusive)
    }

    /// Computes the exclusive prefix reduction: `recvbuf` on rank `r > 0`
    /// receives the fold of the contributions of ranks `0..r`; on rank 0
    /// `recvbuf` is left untouched.
    ///
    /// Fails with [`Error::Unsupported`] when the underlying transport
    /// does not implement the exclusive variant.
    fn exclusive_scan_into<S, R, O>(&self, sendbuf: &S, recvbuf: &mut R, op: O) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
        O: Operation,
    {
        if !self.supports_exclusive_scan() {
            return Err(Error::Unsupported(
                "exclusive scan is not available on this communicator",
            ));
        }
        check_same_type(sendbuf, recvbuf)?;
        if sendbuf.count() != recvbuf.count() {
            return Err(Error::LengthMismatch {
                expected: sendbuf.count() as usize,
                actual: recvbuf.count() as usize,
            });
        }
        let op = op.op();
        op.validate()?;
        let size = self.size();
        let rank = self.rank();
        let own = sendbuf.pack();
        let prefix = if rank > 0 {
            Some(receive_expected(self, rank - 1, EXSCAN_TAG, own.len())?)
        } else {
            None
        };
        if rank + 1 < size {
            let mut forward = own;
            if let Some(prefix) = &prefix {
                reduce_packed(
                    prefix,
                    &mut forward,
                    recvbuf.element_type(),
                    recvbuf.count(),
                    op,
                )?;
            }
            self.send(rank + 1, EXSCAN_TAG, &forward)?;
        }
        match prefix {
            Some(prefix) => recvbuf.unpack(&prefix),
            None => Ok(()),
        }
    }
}

impl<C: Communicator> CommunicatorCollectives for C {}

/// Collective patterns in which one process, the root, plays a special
/// role. Implemented by [`Process`]; every process of the group calls the
/// pattern through a `Process` value naming the same root.
pub trait Root: AsCommunicator {
    /// The rank of the root process.
    fn root_rank(&self) -> Rank;

    /// Whether the calling process is the root.
    fn is_root(&self) -> bool {
        self.as_communicator().rank() == self.root_rank()
    }

    /// Broadcasts the contents of `buffer` on the root into `buffer` on
    /// every other process.
    ///
    /// With a derived-layout buffer only the selected elements travel;
    /// unselected elements of the destination are left untouched.
    fn broadcast_into<B>(&self, buffer: &mut B) -> Result<()>
    where
        B: BufferMut + ?Sized,
    {
        let comm = self.as_communicator();
        let root = self.root_rank();
        trace!(
            "rank {} broadcasting {} elements from root {}",
            comm.rank(),
            buffer.count(),
            root
        );
        if comm.rank() == root {
            let payload = buffer.pack();
            for peer in 0..comm.size() {
                if peer != root {
                    comm.send(peer, BROADCAST_TAG, &payload)?;
                }
            }
            Ok(())
        } else {
            let payload = receive_expected(comm, root, BROADCAST_TAG, buffer.byte_extent())?;
            buffer.unpack(&payload)
        }
    }

    /// Gathers `sendbuf` at the root; called by non-root processes.
    fn gather_into<S>(&self, sendbuf: &S) -> Result<()>
    where
        S: Buffer + ?Sized,
    {
        let comm = self.as_communicator();
        if self.is_root() {
            return Err(Error::InvalidArgument(
                "the root process must supply a receive buffer",
            ));
        }
        comm.send(self.root_rank(), GATHER_TAG, &sendbuf.pack())
    }

    /// Gathers `sendbuf` from every process into `recvbuf` in rank order;
    /// called by the root.
    ///
    /// `recvbuf` must hold `size` times the count of `sendbuf`.
    fn gather_into_root<S, R>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
    {
        let comm = self.as_communicator();
        if !self.is_root() {
            return Err(Error::InvalidArgument(
                "only the root process receives the gathered data",
            ));
        }
        check_same_type(sendbuf, recvbuf)?;
        if recvbuf.count() != sendbuf.count() * comm.size() {
            return Err(Error::LengthMismatch {
                expected: (sendbuf.count() * comm.size()) as usize,
                actual: recvbuf.count() as usize,
            });
        }
        let mut gathered = vec![0u8; recvbuf.byte_extent()];
        gather_fan_in(
            comm,
            self.root_rank(),
            GATHER_TAG,
            Contribution::Packed(sendbuf.pack()),
            &mut gathered,
        )?;
        recvbuf.unpack(&gathered)
    }

    /// Gathers in place at the root: the root's own contribution already
    /// occupies its rank's segment of `recvbuf`.
    ///
    /// The count of `recvbuf` must be divisible by the group size.
    fn gather_in_place_into_root<R>(&self, recvbuf: &mut R) -> Result<()>
    where
        R: BufferMut + ?Sized,
    {
        let comm = self.as_communicator();
        if !self.is_root() {
            return Err(Error::InvalidArgument(
                "only the root process gathers in place",
            ));
        }
        if recvbuf.count() % comm.size() != 0 {
            return Err(Error::InvalidArgument(
                "receive count is not divisible by the group size",
            ));
        }
        let mut gathered = recvbuf.pack();
        gather_fan_in(
            comm,
            self.root_rank(),
            GATHER_TAG,
            Contribution::InPlace,
            &mut gathered,
        )?;
        recvbuf.unpack(&gathered)
    }

    /// Receives this process's segment of a scatter; called by non-root
    /// processes.
    fn scatter_into<R>(&self, recvbuf: &mut R) -> Result<()>
    where
        R: BufferMut + ?Sized,
    {
        let comm = self.as_communicator();
        if self.is_root() {
            return Err(Error::InvalidArgument(
                "the root process must supply a send buffer",
            ));
        }
        let payload = receive_expected(comm, self.root_rank(), SCATTER_TAG, recvbuf.byte_extent())?;
        recvbuf.unpack(&payload)
    }

    /// Scatters the per-rank segments of `sendbuf` to the group in rank
    /// order; called by the root.
    ///
    /// `sendbuf` must hold `size` times the count of `recvbuf`.
    fn scatter_into_root<S, R>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
    {
        let comm = self.as_communicator();
        if !self.is_root() {
            return Err(Error::InvalidArgument(
                "only the root process supplies the scattered data",
            ));
        }
        check_same_type(sendbuf, recvbuf)?;
        if sendbuf.count() != recvbuf.count() * comm.size() {
            return Err(Error::LengthMismatch {
                expected: (recvbuf.count() * comm.size()) as usize,
                actual: sendbuf.count() as usize,
            });
        }
        let outgoing = sendbuf.pack();
        let size = comm.size() as usize;
        let root = self.root_rank();
        for peer in 0..comm.size() {
            if peer != root {
                comm.send(peer, SCATTER_TAG, segment(&outgoing, size, peer as usize))?;
            }
        }
        recvbuf.unpack(segment(&outgoing, size, root as usize))
    }

    /// Scatters in place at the root: the root keeps its own segment of
    /// `sendbuf` where it is and delivers nothing to itself.
    ///
    /// The count of `sendbuf` must be divisible by the group size.
    fn scatter_in_place_into_root<S>(&self, sendbuf: &S) -> Result<()>
    where
        S: Buffer + ?Sized,
    {
        let comm = self.as_communicator();
        if !self.is_root() {
            return Err(Error::InvalidArgument(
                "only the root process scatters in place",
            ));
        }
        if sendbuf.count() % comm.size() != 0 {
            return Err(Error::InvalidArgument(
                "send count is not divisible by the group size",
            ));
        }
        let outgoing = sendbuf.pack();
        let size = comm.size() as usize;
        let root = self.root_rank();
        for peer in 0..comm.size() {
            if peer != root {
                comm.send(peer, SCATTER_TAG, segment(&outgoing, size, peer as usize))?;
            }
        }
        Ok(())
    }

    /// Contributes `sendbuf` to a reduction whose result lands at the
    /// root; called by non-root processes.
    fn reduce_into<S, O>(&self, sendbuf: &S, op: O) -> Result<()>
    where
        S: Buffer + ?Sized,
        O: Operation,
    {
        let comm = self.as_communicator();
        if self.is_root() {
            return Err(Error::InvalidArgument(
                "the root process must supply a receive buffer",
            ));
        }
        op.op().validate()?;
        comm.send(self.root_rank(), REDUCE_TAG, &sendbuf.pack())
    }

    /// Reduces `sendbuf` element-wise across the group with `op`, leaving
    /// the result in `recvbuf`; called by the root.
    fn reduce_into_root<S, R, O>(&self, sendbuf: &S, recvbuf: &mut R, op: O) -> Result<()>
    where
        S: Buffer + ?Sized,
        R: BufferMut + ?Sized,
        O: Operation,
    {
        check_same_type(sendbuf, recvbuf)?;
        if sendbuf.count() != recvbuf.count() {
            return Err(Error::LengthMismatch {
                expected: sendbuf.count() as usize,
                actual: recvbuf.count() as usize,
            });
        }
        reduce_packed_root(self.as_communicator(), self.root_rank(), sendbuf.pack(), recvbuf, op.op())
    }

    /// Reduce in place at the root: `recvbuf` holds the root's
    /// contribution on entry and the reduced result on exit.
    fn reduce_in_place_into_root<R, O>(&self, recvbuf: &mut R, op: O) -> Result<()>
    where
        R: BufferMut + ?Sized,
        O: Operation,
    {
        let comm = self.as_communicator();
        if comm.rank() != self.root_rank() {
            return Err(Error::InvalidArgument(
                "only the root process reduces in place",
            ));
        }
        let contribution = recvbuf.pack();
        reduce_packed_root(comm, self.root_rank(), contribution, recvbuf, op.op())
    }
}

/// Fans contributions in at the root and folds them in ascending rank
/// order into `recvbuf`. The root's own contribution arrives pre-packed.
fn reduce_packed_root<C, R>(
    comm: &C,
    root: Rank,
    contribution: Vec<u8>,
    recvbuf: &mut R,
    op: Op,
) -> Result<()>
where
    C: Communicator + ?Sized,
    R: BufferMut + ?Sized,
{
    if comm.rank() != root {
        return Err(Error::InvalidArgument(
            "only the root process receives the reduced result",
        ));
    }
    op.validate()?;
    let size = comm.size() as usize;
    let extent = recvbuf.byte_extent();
    let mut gathered = vec![0u8; extent * size];
    gather_fan_in(
        comm,
        root,
        REDUCE_TAG,
        Contribution::Packed(contribution),
        &mut gathered,
    )?;
    let result = fold_ascending(comm, &gathered, recvbuf.element_type(), recvbuf.count(), op)?;
    recvbuf.unpack(&result)
}

impl<'a, C: 'a + Communicator> Root for Process<'a, C> {
    fn root_rank(&self) -> Rank {
        self.rank()
    }
}
