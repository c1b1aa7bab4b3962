//! In-process transport
//!
//! A [`LocalCommunicator`] connects the threads of one process into a
//! group. Every ordered rank pair gets its own unbounded channel, so
//! `send` completes without a matching `receive` having been posted --
//! the buffered-send contract the collective schedules rely on. Messages
//! are matched by source and tag; a message received ahead of the tag a
//! caller asked for is stashed until someone asks for it.
//!
//! [`create_group`] builds the mesh; [`run`] drives one closure per rank
//! on scoped threads and propagates panics to the caller.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::error::{Error, Result};
use crate::topology::{AsCommunicator, Communicator, Rank};
use crate::Tag;

type Message = (Tag, Vec<u8>);

struct Mailbox {
    receiver: Receiver<Message>,
    stash: Mutex<VecDeque<Message>>,
}

/// One process's endpoint of a thread-backed group.
pub struct LocalCommunicator {
    rank: Rank,
    size: Rank,
    // indexed by destination rank
    senders: Vec<Sender<Message>>,
    // indexed by source rank
    mailboxes: Vec<Mailbox>,
}

impl LocalCommunicator {
    fn check_peer(&self, peer: Rank) -> Result<()> {
        if peer < 0 || peer >= self.size {
            return Err(Error::InvalidArgument("peer rank out of range"));
        }
        Ok(())
    }
}

impl Communicator for LocalCommunicator {
    fn size(&self) -> Rank {
        self.size
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn send(&self, destination: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        self.check_peer(destination)?;
        self.senders[destination as usize]
            .send((tag, payload.to_vec()))
            .map_err(|_| Error::Transport(format!("rank {} has left the group", destination)))
    }

    fn receive(&self, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        self.check_peer(source)?;
        let mailbox = &self.mailboxes[source as usize];
        let mut stash = mailbox.stash.lock().expect("mailbox stash lock poisoned");
        if let Some(at) = stash.iter().position(|(t, _)| *t == tag) {
            // VecDeque::remove cannot fail here, the index came from the scan
            let (_, payload) = stash.remove(at).expect("stash entry vanished");
            return Ok(payload);
        }
        loop {
            let (t, payload) = mailbox
                .receiver
                .recv()
                .map_err(|_| Error::Transport(format!("rank {} has left the group", source)))?;
            if t == tag {
                return Ok(payload);
            }
            stash.push_back((t, payload));
        }
    }
}

impl AsCommunicator for LocalCommunicator {
    type Out = LocalCommunicator;

    fn as_communicator(&self) -> &Self::Out {
        self
    }
}

/// Builds a fully connected group of `size` communicators, one per rank.
///
/// # Panics
///
/// Panics if `size` is not positive.
pub fn create_group(size: Rank) -> Vec<LocalCommunicator> {
    assert!(size > 0, "group size must be positive");
    let n = size as usize;
    // links[s][d] is the channel carrying messages from rank s to rank d
    let links: Vec<Vec<(Sender<Message>, Receiver<Message>)>> = (0..n)
        .map(|_| (0..n).map(|_| unbounded()).collect())
        .collect();
    let senders_of: Vec<Vec<Sender<Message>>> = (0..n)
        .map(|s| (0..n).map(|d| links[s][d].0.clone()).collect())
        .collect();
    let mut mailboxes_of: Vec<Vec<Option<Mailbox>>> = (0..n)
        .map(|_| (0..n).map(|_| None).collect())
        .collect();
    for (s, row) in links.into_iter().enumerate() {
        for (d, (_, receiver)) in row.into_iter().enumerate() {
            mailboxes_of[d][s] = Some(Mailbox {
                receiver,
                stash: Mutex::new(VecDeque::new()),
            });
        }
    }
    debug!("created local group of {} processes", size);
    senders_of
        .into_iter()
        .zip(mailboxes_of)
        .enumerate()
        .map(|(rank, (senders, mailboxes))| LocalCommunicator {
            rank: rank as Rank,
            size,
            senders,
            mailboxes: mailboxes.into_iter().flatten().collect(),
        })
        .collect()
}

/// Runs `f` once per rank of a fresh group of `size`, each invocation on
/// its own thread. Returns when every rank has finished; a panic on any
/// rank propagates.
pub fn run<F>(size: Rank, f: F)
where
    F: Fn(LocalCommunicator) + Send + Sync,
{
    let group = create_group(size);
    let f = &f;
    thread::scope(|scope| {
        for comm in group {
            scope.spawn(move || f(comm));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ranks_are_consecutive() {
        let group = create_group(3);
        assert_eq!(group.len(), 3);
        for (i, comm) in group.iter().enumerate() {
            assert_eq!(comm.rank(), i as Rank);
            assert_eq!(comm.size(), 3);
        }
    }

    #[test]
    fn messages_match_by_tag_out_of_order() {
        let group = create_group(2);
        group[0].send(1, 7, b"seven").unwrap();
        group[0].send(1, 8, b"eight").unwrap();
        assert_eq!(group[1].receive(0, 8).unwrap(), b"eight");
        assert_eq!(group[1].receive(0, 7).unwrap(), b"seven");
    }

    #[test]
    fn messages_match_by_source() {
        let group = create_group(3);
        group[0].send(2, 1, b"from zero").unwrap();
        group[1].send(2, 1, b"from one").unwrap();
        assert_eq!(group[2].receive(1, 1).unwrap(), b"from one");
        assert_eq!(group[2].receive(0, 1).unwrap(), b"from zero");
    }

    #[test]
    fn peer_ranks_are_bounds_checked() {
        let group = create_group(1);
        assert!(matches!(
            group[0].send(1, 0, &[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            group[0].receive(-1, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn run_drives_one_thread_per_rank() {
        use std::sync::atomic::{AtomicI32, Ordering};
        let seen = AtomicI32::new(0);
        run(4, |comm| {
            seen.fetch_add(comm.rank(), Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
