//! Cross-process transport: one TCP connection between the root and every other rank.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ bincode-encoded Message  │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! A connecting rank first sends `Hello { rank }`. One reader thread per
//! connection decodes frames into the endpoint's inbox; a connection that closes
//! before its last expected message turns into an abort from that rank.

use super::comm::{Endpoint, Link, Message, ROOT};
use crate::error::{MosaicError, Result};
use crossbeam_channel::{Sender, unbounded};
use log::{debug, info};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_BYTES: usize = 1 << 30;

/// Pause between connection attempts while the root is not listening yet.
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Endpoint of one rank in a multi-process run.
pub type TcpComm = Endpoint<TcpLink>;

#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
}

impl Link for TcpLink {
    fn deliver(&self, message: Message) -> Result<()> {
        write_frame(&self.stream, &message)
    }
}

fn write_frame(mut stream: &TcpStream, message: &Message) -> Result<()> {
    let payload = bincode::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| MosaicError::Communication(format!("failed to encode {message:?}: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MosaicError::Communication(format!("{} byte frame is too large", payload.len())))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(mut stream: &TcpStream) -> Result<Message> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(MosaicError::Communication(format!("{len} byte frame exceeds the limit")));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    let (message, _) = bincode::decode_from_slice(&payload, bincode::config::standard())
        .map_err(|e| MosaicError::Communication(format!("failed to decode frame: {e}")))?;
    Ok(message)
}

/// Forward frames from `peer` into `inbox` until its last expected message.
fn spawn_reader(peer: usize, stream: TcpStream, inbox: Sender<Message>) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("mosaic-rank-link-{peer}"))
        .spawn(move || {
            loop {
                match read_frame(&stream) {
                    Ok(message) => {
                        let terminal = message.is_terminal();
                        if inbox.send(message).is_err() || terminal {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Link to rank {peer} closed: {e}");
                        let _ = inbox.send(Message::Abort {
                            rank: peer,
                            reason: format!("connection closed: {e}"),
                        });
                        return;
                    }
                }
            }
        })?;
    Ok(())
}

impl TcpComm {
    /// Root side: accept one connection from every other rank of a `size`-rank run.
    pub fn accept(listener: &TcpListener, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MosaicError::Communication("a cluster needs at least one rank".into()));
        }
        let (sender, inbox) = unbounded();
        let mut peers: Vec<Option<TcpLink>> = (0..size).map(|_| None).collect();
        info!("Root waiting for {} rank(s) on {:?}", size - 1, listener.local_addr().ok());

        while peers.iter().skip(1).any(Option::is_none) {
            let (stream, address) = listener.accept()?;
            stream.set_nodelay(true)?;
            let rank = match read_frame(&stream)? {
                Message::Hello { rank } => rank,
                other => {
                    return Err(MosaicError::Communication(format!(
                        "connection from {address} opened with {other:?}"
                    )));
                }
            };
            if rank == ROOT || rank >= size || peers[rank].is_some() {
                return Err(MosaicError::Communication(format!(
                    "connection from {address} claims rank {rank} of {size}"
                )));
            }
            debug!("Rank {rank} connected from {address}");
            spawn_reader(rank, stream.try_clone()?, sender.clone())?;
            peers[rank] = Some(TcpLink { stream });
        }
        Ok(Endpoint::new(ROOT, size, inbox, peers))
    }

    /// Non-root side: connect to the root at `root`, retrying until `timeout` elapses.
    pub fn connect(root: impl ToSocketAddrs, rank: usize, size: usize, timeout: Duration) -> Result<Self> {
        if rank == ROOT || rank >= size {
            return Err(MosaicError::Communication(format!("rank {rank} cannot join a {size}-rank run as a peer")));
        }
        let addresses: Vec<_> = root.to_socket_addrs()?.collect();
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match addresses.iter().find_map(|address| TcpStream::connect(address).ok()) {
                Some(stream) => break stream,
                None if Instant::now() < deadline => std::thread::sleep(CONNECT_RETRY),
                None => {
                    return Err(MosaicError::Communication(format!(
                        "rank {rank} could not reach the root at {addresses:?}"
                    )));
                }
            }
        };
        stream.set_nodelay(true)?;
        write_frame(&stream, &Message::Hello { rank })?;

        let (sender, inbox) = unbounded();
        spawn_reader(ROOT, stream.try_clone()?, sender)?;
        let mut peers: Vec<Option<TcpLink>> = (0..size).map(|_| None).collect();
        peers[ROOT] = Some(TcpLink { stream });
        debug!("Rank {rank} connected to the root");
        Ok(Endpoint::new(rank, size, inbox, peers))
    }
}
