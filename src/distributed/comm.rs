//! Message passing between ranks.
//!
//! The exchange has two join points: every rank reports its row count to the root,
//! the root releases everyone once the gather layout is known, and then every rank
//! sends its slice. Any rank may abort instead, which fails the run on every rank.

use crate::error::{MosaicError, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use std::cell::Cell;

/// Rank that gathers the results.
pub const ROOT: usize = 0;

pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    /// Non-root: report how many tile rows this rank computed.
    fn send_row_count(&self, rows: usize) -> Result<()>;

    /// Root: `(rank, rows)` from every other rank, in arrival order.
    fn collect_row_counts(&self) -> Result<Vec<(usize, usize)>>;

    /// Root: let every rank proceed to the gather.
    fn release(&self) -> Result<()>;

    /// Non-root: block until the root released the gather.
    fn wait_release(&self) -> Result<()>;

    /// Non-root: send this rank's result slice to the root.
    fn send_slice(&self, indices: Vec<u32>) -> Result<()>;

    /// Root: `(rank, indices)` from every other rank, in arrival order.
    fn collect_slices(&self) -> Result<Vec<(usize, Vec<u32>)>>;

    /// Fail the run on every rank.
    fn abort(&self, reason: &str);
}

/// Messages exchanged between ranks.
#[derive(Debug)]
#[cfg_attr(feature = "tcp", derive(bincode::Encode, bincode::Decode))]
pub enum Message {
    /// First frame on a new connection, naming the connecting rank.
    Hello { rank: usize },
    RowCount { rank: usize, rows: usize },
    Proceed,
    Slice { rank: usize, indices: Vec<u32> },
    Abort { rank: usize, reason: String },
}

impl Message {
    /// Last message a rank expects on a link before it closes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::Proceed | Message::Slice { .. } | Message::Abort { .. })
    }
}

/// Outgoing half of a connection to one other rank.
pub trait Link: Send + std::fmt::Debug {
    /// Deliver `message`; fails once the other side is gone.
    fn deliver(&self, message: Message) -> Result<()>;
}

impl Link for Sender<Message> {
    fn deliver(&self, message: Message) -> Result<()> {
        self.send(message)
            .map_err(|_| MosaicError::Communication("receiving rank is gone".into()))
    }
}

/// One rank's side of the exchange over links of type `L`.
///
/// Incoming messages from every link arrive on a single inbox. Dropping an
/// endpoint that neither finished its part of the exchange nor aborted (for
/// example while unwinding from a panic) aborts the run.
#[derive(Debug)]
pub struct Endpoint<L: Link> {
    rank: usize,
    size: usize,
    inbox: Receiver<Message>,
    /// Root: one link per rank. Others: only the root's.
    peers: Vec<Option<L>>,
    finished: Cell<bool>,
    aborted: Cell<bool>,
}

/// Endpoint of one rank in a [`LocalCluster`].
pub type LocalComm = Endpoint<Sender<Message>>;

/// In-process cluster: one endpoint per rank, each meant for its own thread.
#[derive(Debug)]
pub struct LocalCluster;

impl LocalCluster {
    pub fn new(size: usize) -> Result<Vec<LocalComm>> {
        if size == 0 {
            return Err(MosaicError::Communication("a cluster needs at least one rank".into()));
        }
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded::<Message>()).unzip();

        let endpoints = inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                let peers = (0..size)
                    .map(|peer| {
                        let linked = if rank == ROOT { peer != ROOT } else { peer == ROOT };
                        linked.then(|| senders[peer].clone())
                    })
                    .collect();
                Endpoint::new(rank, size, inbox, peers)
            })
            .collect();
        debug!("Local cluster of {size} ranks created");
        Ok(endpoints)
    }
}

impl<L: Link> Endpoint<L> {
    pub(crate) fn new(rank: usize, size: usize, inbox: Receiver<Message>, peers: Vec<Option<L>>) -> Self {
        Self {
            rank,
            size,
            inbox,
            peers,
            finished: Cell::new(false),
            aborted: Cell::new(false),
        }
    }

    fn send(&self, to: usize, message: Message) -> Result<()> {
        let peer = self.peers.get(to).and_then(Option::as_ref).ok_or_else(|| {
            MosaicError::Communication(format!("rank {} has no link to rank {to}", self.rank))
        })?;
        peer.deliver(message).map_err(|e| {
            // a peer that aborted and left may have told us why before going
            self.pending_abort()
                .unwrap_or_else(|| MosaicError::Communication(format!("rank {to} is gone: {e}")))
        })
    }

    /// Abort already waiting in the inbox, if any.
    fn pending_abort(&self) -> Option<MosaicError> {
        while let Ok(message) = self.inbox.try_recv() {
            if let Message::Abort { rank, reason } = message {
                self.aborted.set(true);
                return Some(MosaicError::RankAborted { rank, reason });
            }
        }
        None
    }

    fn receive(&self) -> Result<Message> {
        match self.inbox.recv() {
            Ok(Message::Abort { rank, reason }) => {
                if self.is_root() {
                    self.abort(&format!("rank {rank} aborted: {reason}"));
                }
                self.aborted.set(true);
                Err(MosaicError::RankAborted { rank, reason })
            }
            Ok(message) => Ok(message),
            Err(_) => Err(MosaicError::Communication(format!(
                "rank {} lost every peer",
                self.rank
            ))),
        }
    }

    fn require_root(&self, operation: &str) -> Result<()> {
        if self.is_root() {
            Ok(())
        } else {
            Err(MosaicError::Communication(format!("{operation} is only valid on the root rank")))
        }
    }

    fn require_peer(&self, operation: &str) -> Result<()> {
        if self.is_root() {
            Err(MosaicError::Communication(format!("{operation} is not valid on the root rank")))
        } else {
            Ok(())
        }
    }

    fn unexpected(&self, message: Message, expecting: &str) -> MosaicError {
        MosaicError::Communication(format!(
            "rank {} expected {expecting}, received {message:?}",
            self.rank
        ))
    }
}

impl<L: Link> Communicator for Endpoint<L> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_row_count(&self, rows: usize) -> Result<()> {
        self.require_peer("send_row_count")?;
        self.send(ROOT, Message::RowCount { rank: self.rank, rows })
    }

    fn collect_row_counts(&self) -> Result<Vec<(usize, usize)>> {
        self.require_root("collect_row_counts")?;
        let mut counts = Vec::with_capacity(self.size - 1);
        while counts.len() < self.size - 1 {
            match self.receive()? {
                Message::RowCount { rank, rows } => counts.push((rank, rows)),
                other => return Err(self.unexpected(other, "a row count")),
            }
        }
        Ok(counts)
    }

    fn release(&self) -> Result<()> {
        self.require_root("release")?;
        for peer in (0..self.size).filter(|&peer| peer != ROOT) {
            self.send(peer, Message::Proceed)?;
        }
        Ok(())
    }

    fn wait_release(&self) -> Result<()> {
        self.require_peer("wait_release")?;
        match self.receive()? {
            Message::Proceed => Ok(()),
            other => Err(self.unexpected(other, "the gather release")),
        }
    }

    fn send_slice(&self, indices: Vec<u32>) -> Result<()> {
        self.require_peer("send_slice")?;
        self.send(ROOT, Message::Slice { rank: self.rank, indices })?;
        self.finished.set(true);
        Ok(())
    }

    fn collect_slices(&self) -> Result<Vec<(usize, Vec<u32>)>> {
        self.require_root("collect_slices")?;
        let mut slices = Vec::with_capacity(self.size - 1);
        while slices.len() < self.size - 1 {
            match self.receive()? {
                Message::Slice { rank, indices } => slices.push((rank, indices)),
                other => return Err(self.unexpected(other, "a result slice")),
            }
        }
        self.finished.set(true);
        Ok(slices)
    }

    fn abort(&self, reason: &str) {
        if self.aborted.replace(true) {
            return;
        }
        warn!("Rank {} aborting the run: {}", self.rank, reason);
        for peer in self.peers.iter().flatten() {
            // peers that already finished have dropped their inbox
            let _ = peer.deliver(Message::Abort {
                rank: self.rank,
                reason: reason.to_string(),
            });
        }
    }
}

impl<L: Link> Drop for Endpoint<L> {
    fn drop(&mut self) {
        if !self.finished.get() && !self.aborted.get() {
            self.abort("rank left the exchange early");
        }
    }
}
