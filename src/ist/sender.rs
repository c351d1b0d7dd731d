//! Sender endpoint and the pool of asynchronous donor threads.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::cache::WriteSetCache;
use crate::config::Config;
use crate::ist::proto::{CTRL_EOF, Proto};
use crate::ist::{IstError, VER_RELAXED_RANGE};
use crate::seqno::Seqno;
use crate::tls::{self, Conn};

/// Events fetched from the write-set cache per batch.
const SEND_BATCH: usize = 1024;

/// Donor-side endpoint: connects to the joiner and streams a seqno range
/// out of the write-set cache.
pub struct Sender {
    conn: Conn,
    proto: Proto,
    cache: Arc<dyn WriteSetCache>,
    version: u32,
}

impl Sender {
    /// Resolve and connect to the joiner's advertised address, performing
    /// the TLS client handshake for `ssl://` peers.
    pub fn connect(
        config: &Config,
        cache: Arc<dyn WriteSetCache>,
        peer: &str,
        version: u32,
    ) -> Result<Self, IstError> {
        let endpoint = crate::config::Endpoint::parse(
            peer,
            config.default_scheme(),
            Some(config.default_recv_port()),
        )?;

        let sock = TcpStream::connect(endpoint.authority()).map_err(|err| {
            error!("ist sender failed to connect '{endpoint}': {err}");
            err
        })?;

        let conn = if endpoint.is_tls() {
            info!("ist sender using tls");
            let identity = config
                .tls_identity()?
                .ok_or(crate::config::ConfigError::TlsIdentityMissing)?;
            let tls_config =
                tls::client_config(&identity).map_err(crate::config::ConfigError::TlsIdentity)?;
            Conn::TlsClient(tls::connect(Arc::new(tls_config), sock)?)
        } else {
            sock.set_nodelay(true)?;
            Conn::Tcp(sock)
        };

        Ok(Sender {
            conn,
            proto: Proto::new(version, config.keep_keys, config.max_frame_bytes),
            cache,
            version,
        })
    }

    /// A clone of the underlying socket, for out-of-band cancellation.
    pub fn stream_clone(&self) -> std::io::Result<TcpStream> {
        self.conn.tcp_stream().try_clone()
    }

    /// Stream `[first, last]`, flagging events at or above `preload_start`
    /// for certification preload, then send EOF and drain.
    pub fn send(
        &mut self,
        first: Seqno,
        last: Seqno,
        preload_start: Seqno,
    ) -> Result<(), IstError> {
        if first > last && self.version < VER_RELAXED_RANGE {
            debug_assert!(false, "sender range inverted: {first} > {last}");
            return Err(IstError::InvalidRange { first, last });
        }

        let handshake = self.proto.recv_handshake(&mut self.conn)?;
        if !handshake.keep_keys {
            debug!("joiner requests write-set key annotations stripped");
        }
        self.proto
            .send_handshake_response(&mut self.conn, first, last)?;
        let ctrl = self.proto.recv_ctrl(&mut self.conn)?;
        if ctrl < 0 {
            return Err(IstError::Rejected { code: ctrl });
        }

        // notify the joiner even when there is nothing to send
        if first > last || (first == Seqno::NONE && last == Seqno::NONE) {
            info!("ist sender notifying joiner, not sending anything");
            return self.send_eof();
        }
        info!("ist sender {first} -> {last}");

        self.cache.seqno_lock(first);

        let mut next = first;
        loop {
            let remaining = (last.get() - next.get() + 1) as usize;
            let events = self
                .cache
                .seqno_get_buffers(next, remaining.min(SEND_BATCH))?;
            let count = events.len() as i64;
            for event in &events {
                // preload_start is the seqno of the lowest transaction in
                // the certification index at the configuration change; zero
                // means the index was fully reset and nothing preloads
                let preload =
                    preload_start.get() > 0 && event.seqno >= preload_start;
                self.proto.send_ordered(&mut self.conn, event, preload)?;
                if event.seqno == last {
                    return self.send_eof();
                }
            }
            next = next + count;
        }
    }

    /// Send the end-of-stream control message, then wait for the joiner to
    /// close its side. Data arriving here is suspicious but not fatal.
    fn send_eof(&mut self) -> Result<(), IstError> {
        self.proto.send_ctrl(&mut self.conn, CTRL_EOF)?;

        let mut byte = [0u8; 1];
        match self.conn.read(&mut byte) {
            Ok(0) | Err(_) => {}
            Ok(n) => warn!("received {n} bytes while draining, expected none"),
        }
        Ok(())
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        // the cache range stays pinned for exactly as long as the sender
        // lives, on every exit path
        self.cache.seqno_unlock();
    }
}

/// Cancellation handle for one async sender: shutting the socket down
/// forces any blocking read or write in the sender thread to fail.
struct SenderCancel {
    stream: Mutex<Option<TcpStream>>,
    cancelled: AtomicBool,
}

impl SenderCancel {
    fn new(stream: Option<TcpStream>) -> Self {
        SenderCancel {
            stream: Mutex::new(stream),
            cancelled: AtomicBool::new(false),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        let stream = self.stream.lock().expect("sender cancel poisoned");
        if let Some(stream) = stream.as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

struct SenderEntry {
    peer: String,
    cancel: Arc<SenderCancel>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct SenderTable {
    next_id: u64,
    entries: BTreeMap<u64, SenderEntry>,
}

/// Owns one thread per outbound transfer. Threads remove themselves when
/// their send completes; [`cancel`](AsyncSenderMap::cancel) tears down
/// whatever is still running.
pub struct AsyncSenderMap {
    cache: Arc<dyn WriteSetCache>,
    table: Arc<Mutex<SenderTable>>,
}

impl AsyncSenderMap {
    pub fn new(cache: Arc<dyn WriteSetCache>) -> Self {
        AsyncSenderMap {
            cache,
            table: Arc::new(Mutex::new(SenderTable::default())),
        }
    }

    pub fn cache(&self) -> &Arc<dyn WriteSetCache> {
        &self.cache
    }

    /// Number of transfers currently in flight.
    pub fn len(&self) -> usize {
        self.table.lock().expect("sender table poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connect to `peer` and start a detached transfer of
    /// `[first, last]`. Connection errors surface here; anything after
    /// that is reported through the completion seqno (`last` on success,
    /// the negated error code on failure).
    pub fn run(
        &self,
        config: &Config,
        peer: &str,
        first: Seqno,
        last: Seqno,
        preload_start: Seqno,
        version: u32,
    ) -> Result<(), IstError> {
        let mut table = self.table.lock().expect("sender table poisoned");

        let mut sender = Sender::connect(config, Arc::clone(&self.cache), peer, version)?;
        let cancel = Arc::new(SenderCancel::new(sender.stream_clone().ok()));

        let id = table.next_id;
        table.next_id += 1;

        let peer_owned = peer.to_string();
        let table_ref = Arc::clone(&self.table);
        let thread_cancel = Arc::clone(&cancel);
        let thread = thread::Builder::new()
            .name("ist-send".to_string())
            .spawn(move || {
                info!(
                    "async ist sender starting to serve {peer_owned} sending \
                     {first}-{last}, preload starts from {preload_start}"
                );
                let join_seqno = match sender.send(first, last, preload_start) {
                    Ok(()) => last,
                    Err(err) => {
                        if thread_cancel.cancelled.load(Ordering::Relaxed) {
                            debug!("async ist sender to {peer_owned} cancelled");
                        } else {
                            error!("async ist sender failed to serve {peer_owned}: {err}");
                        }
                        Seqno::new(-i64::from(err.code()))
                    }
                };
                remove(&table_ref, id, join_seqno);
                info!("async ist sender served {peer_owned}");
            })?;

        table.entries.insert(
            id,
            SenderEntry {
                peer: peer.to_string(),
                cancel,
                thread,
            },
        );
        Ok(())
    }

    /// Cancel every in-flight transfer and join its thread. The table lock
    /// is dropped around each join: an exiting sender thread takes it to
    /// remove itself, and holding it here would deadlock.
    pub fn cancel(&self) {
        loop {
            let entry = {
                let mut table = self.table.lock().expect("sender table poisoned");
                match table.entries.pop_first() {
                    Some((_, entry)) => entry,
                    None => break,
                }
            };
            entry.cancel.cancel();
            if entry.thread.join().is_err() {
                warn!("ist sender thread to {} panicked", entry.peer);
            }
        }
    }
}

/// Remove a completed sender from the table. Dropping the entry drops the
/// thread's own join handle, detaching it. An entry that is already gone
/// means the pool was cancelled while the send was in flight.
fn remove(table: &Arc<Mutex<SenderTable>>, id: u64, join_seqno: Seqno) {
    let mut table = table.lock().expect("sender table poisoned");
    match table.entries.remove(&id) {
        Some(_) => debug!("async ist sender done, join seqno {join_seqno}"),
        None => debug!("async ist sender already removed"),
    }
}
