//! Receiver endpoint: accepts the donor connection and drains the stream.

use std::net::TcpListener;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, Endpoint};
use crate::error::{EINTR, EPROTO};
use crate::event::{EventHandler, EventKind, TrxPool};
use crate::ist::proto::{CTRL_EOF, CTRL_OK, Proto};
use crate::ist::{IstError, VER_CERT_AUTH};
use crate::seqno::Seqno;
use crate::tls::{self, Conn};

/// Report progress at most once per this much wall time...
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_secs(10);
/// ...and at most once per this many events.
const PROGRESS_MIN_EVENTS: u64 = 16;

/// Receiver endpoint of an incremental state transfer.
///
/// Lifecycle: construct, [`prepare`](Receiver::prepare) (binds the listener
/// and spawns the receiver thread), [`ready`](Receiver::ready) once the
/// snapshot transfer has pinned down the real starting seqno, then
/// [`finished`](Receiver::finished) to interrupt if necessary and join.
pub struct Receiver {
    config: Config,
    pool: TrxPool,
    handler: Arc<dyn EventHandler>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    recv_addr: Option<Endpoint>,
    version: u32,
    source_id: Uuid,
    use_tls: bool,
    tls_client: Option<Arc<rustls::ClientConfig>>,
}

struct Shared {
    state: Mutex<RecvState>,
    cond: Condvar,
}

#[derive(Debug)]
struct RecvState {
    first_seqno: Seqno,
    last_seqno: Seqno,
    current_seqno: Seqno,
    ready: bool,
    interrupted: bool,
    running: bool,
    error_code: i32,
}

impl RecvState {
    fn new() -> Self {
        RecvState {
            first_seqno: Seqno::UNDEFINED,
            last_seqno: Seqno::UNDEFINED,
            current_seqno: Seqno::UNDEFINED,
            ready: false,
            interrupted: false,
            running: false,
            error_code: 0,
        }
    }
}

impl Receiver {
    pub fn new(config: Config, pool: TrxPool, handler: Arc<dyn EventHandler>) -> Self {
        Receiver {
            config,
            pool,
            handler,
            shared: Arc::new(Shared {
                state: Mutex::new(RecvState::new()),
                cond: Condvar::new(),
            }),
            thread: None,
            recv_addr: None,
            version: 0,
            source_id: Uuid::nil(),
            use_tls: false,
            tls_client: None,
        }
    }

    /// Bind the listener, spawn the receiver thread, and return the address
    /// to advertise in the transfer request. `first_seqno` is the joiner's
    /// estimate; the authoritative value arrives later via
    /// [`ready`](Receiver::ready).
    pub fn prepare(
        &mut self,
        first_seqno: Seqno,
        last_seqno: Seqno,
        version: u32,
        source_id: Uuid,
    ) -> Result<String, IstError> {
        let addr = self.config.resolve_recv_addr()?;
        let bind = self.config.resolve_recv_bind()?;

        let mut tls_server = None;
        if addr.is_tls() {
            info!("ist receiver using tls");
            let identity = self
                .config
                .tls_identity()?
                .ok_or(crate::config::ConfigError::TlsIdentityMissing)?;
            // Senders speaking versions before 7 return a null certificate,
            // so peer verification must stay off for them.
            let require_peer_cert = version >= VER_CERT_AUTH;
            let server = tls::server_config(&identity, require_peer_cert)
                .map_err(crate::config::ConfigError::TlsIdentity)?;
            let client = tls::client_config(&identity)
                .map_err(crate::config::ConfigError::TlsIdentity)?;
            tls_server = Some(Arc::new(server));
            self.tls_client = Some(Arc::new(client));
            self.use_tls = true;
        }

        let listener = TcpListener::bind(bind.authority().as_str()).map_err(|err| {
            error!("failed to open ist listener at {bind}: {err}");
            err
        })?;
        // a configured zero port means "any"; advertise what was bound
        let bound_port = listener.local_addr()?.port();
        let advertised = Endpoint {
            scheme: addr.scheme,
            host: addr.host.clone(),
            port: if addr.port == 0 { bound_port } else { addr.port },
        };

        {
            let mut state = self.shared.state.lock().expect("receiver state poisoned");
            *state = RecvState::new();
            state.first_seqno = first_seqno;
            state.last_seqno = last_seqno;
            state.running = true;
        }

        self.version = version;
        self.source_id = source_id;

        let ctx = RunCtx {
            shared: Arc::clone(&self.shared),
            handler: Arc::clone(&self.handler),
            pool: self.pool.clone(),
            proto: Proto::new(version, self.config.keep_keys, self.config.max_frame_bytes),
            tls: tls_server,
        };
        let thread = thread::Builder::new()
            .name("ist-recv".to_string())
            .spawn(move || run(listener, ctx))?;
        self.thread = Some(thread);
        self.recv_addr = Some(advertised.clone());

        info!(
            "prepared ist receiver for {first_seqno}-{last_seqno}, listening at {advertised}"
        );
        Ok(advertised.to_string())
    }

    /// Snapshot transfer finished: `first` is the seqno applying starts at.
    /// Unblocks the receiver thread.
    pub fn ready(&self, first: Seqno) {
        debug_assert!(first.get() > 0);
        let mut state = self.shared.state.lock().expect("receiver state poisoned");
        state.first_seqno = first;
        state.ready = true;
        self.shared.cond.notify_all();
    }

    /// Interrupt a pending transfer if needed, join the receiver thread,
    /// and return the last seqno processed.
    pub fn finished(&mut self) -> Seqno {
        let Some(addr) = self.recv_addr.take() else {
            debug!("ist receiver was not prepared before finished()");
            let state = self.shared.state.lock().expect("receiver state poisoned");
            return state.current_seqno;
        };

        self.interrupt(&addr);

        {
            // if the receiver never became ready it is parked on the
            // condvar, out of reach of the wire-level interrupt
            let mut state = self.shared.state.lock().expect("receiver state poisoned");
            if !state.ready {
                state.interrupted = true;
                self.shared.cond.notify_all();
            }
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("ist receiver thread panicked");
            }
        }

        let mut state = self.shared.state.lock().expect("receiver state poisoned");
        state.running = false;
        state.current_seqno
    }

    /// UUID of the donor this transfer was prepared against.
    pub fn source_id(&self) -> Uuid {
        self.source_id
    }

    /// The error code of the finished transfer, `0` when clean.
    pub fn error_code(&self) -> i32 {
        self.shared
            .state
            .lock()
            .expect("receiver state poisoned")
            .error_code
    }

    /// Connect to our own listener and deliver an end-of-stream, unblocking
    /// a thread that waits in accept, handshake, or the ordered-read loop.
    /// All failures are ignored: a closed listener just means a live donor
    /// connection exists and the stream will end through it.
    fn interrupt(&self, addr: &Endpoint) {
        if let Err(err) = self.try_interrupt(addr) {
            debug!("ist receiver interrupt: {err}");
        }
    }

    fn try_interrupt(&self, addr: &Endpoint) -> Result<(), IstError> {
        let sock = std::net::TcpStream::connect(addr.authority())?;
        let mut conn = if self.use_tls {
            let config = self
                .tls_client
                .clone()
                .ok_or(crate::config::ConfigError::TlsIdentityMissing)?;
            Conn::TlsClient(tls::connect(config, sock)?)
        } else {
            sock.set_nodelay(true)?;
            Conn::Tcp(sock)
        };

        let proto = Proto::new(
            self.version,
            self.config.keep_keys,
            self.config.max_frame_bytes,
        );
        proto.recv_handshake(&mut conn)?;
        proto.send_ctrl(&mut conn, CTRL_EOF)?;
        // wait for the receiver to drop the connection
        let _ = proto.recv_ctrl(&mut conn);
        Ok(())
    }
}

struct RunCtx {
    shared: Arc<Shared>,
    handler: Arc<dyn EventHandler>,
    pool: TrxPool,
    proto: Proto,
    tls: Option<Arc<rustls::ServerConfig>>,
}

fn run(listener: TcpListener, ctx: RunCtx) {
    let mut conn = None;
    let result = serve(listener, &ctx, &mut conn);

    let mut ec = match result {
        Ok(()) => 0,
        Err(err) => {
            let code = err.code();
            // interrupts are requested, not suffered; keep them quiet
            if code == EINTR {
                debug!("ist receiver interrupted");
            } else {
                error!("ist receive failed: {err}");
            }
            code
        }
    };

    if let Some(conn) = conn.take() {
        let _ = conn.shutdown();
    }

    let mut state = ctx.shared.state.lock().expect("receiver state poisoned");
    state.running = false;
    let expected_any = state.last_seqno.get() > 0 && state.first_seqno <= state.last_seqno;
    if expected_any && ec != EINTR && state.current_seqno < state.last_seqno {
        error!(
            "ist stream did not contain all write-sets: expected last {}, last received {}",
            state.last_seqno, state.current_seqno
        );
        ec = EPROTO;
    }
    if ec != EINTR {
        state.error_code = ec;
    }
    drop(state);

    ctx.handler.ist_end(ec);
}

fn serve(listener: TcpListener, ctx: &RunCtx, conn_out: &mut Option<Conn>) -> Result<(), IstError> {
    let (sock, peer) = listener.accept()?;
    debug!("ist receiver accepted connection from {peer}");
    // one donor per transfer; stop listening
    drop(listener);

    let conn = match &ctx.tls {
        Some(config) => Conn::TlsServer(tls::accept(Arc::clone(config), sock)?),
        None => {
            sock.set_nodelay(true)?;
            Conn::Tcp(sock)
        }
    };
    let conn = conn_out.insert(conn);

    ctx.proto.send_handshake(conn)?;
    let response = ctx.proto.recv_handshake_response(conn)?;
    if response.version != ctx.proto.version {
        debug!(
            "ist sender runs protocol version {}, local {}",
            response.version, ctx.proto.version
        );
    }
    ctx.proto.send_ctrl(conn, CTRL_OK)?;

    // The snapshot transfer decides where applying starts; block until it
    // reports in or the transfer is abandoned.
    let (first_seqno, last_seqno) = {
        let mut state = ctx.shared.state.lock().expect("receiver state poisoned");
        while !state.ready && !state.interrupted {
            state = ctx
                .shared
                .cond
                .wait(state)
                .expect("receiver state poisoned");
        }
        if state.interrupted {
            return Err(IstError::Interrupted);
        }
        (state.first_seqno, state.last_seqno)
    };
    info!("ist applying starts with {first_seqno}");
    debug_assert!(first_seqno.get() > 0);

    let mut progress: Option<Progress> = None;
    let mut preload_started = false;

    loop {
        let Some((event, preload)) = ctx.proto.recv_ordered(conn)? else {
            debug!("eof received, closing socket");
            break;
        };

        let (current_seqno, must_apply) = {
            let mut state = ctx.shared.state.lock().expect("receiver state poisoned");
            if !state.current_seqno.is_defined() {
                // the donor may rewind below first_seqno to supply preload
                if event.seqno > first_seqno {
                    return Err(IstError::FirstSeqno {
                        got: event.seqno,
                        first: first_seqno,
                    });
                }
                info!("ist current seqno initialized to {}", event.seqno);
                state.current_seqno = event.seqno;
                progress = Some(Progress::new(
                    last_seqno.get() - event.seqno.get() + 1,
                ));
            } else {
                state.current_seqno = state.current_seqno.next();
                if let Some(progress) = progress.as_mut() {
                    progress.update(1);
                }
            }
            if event.seqno != state.current_seqno {
                return Err(IstError::Sequence {
                    expected: state.current_seqno,
                    got: event.seqno,
                });
            }
            (state.current_seqno, state.current_seqno >= first_seqno)
        };
        debug_assert!(current_seqno.get() > 0);

        if preload && !preload_started {
            info!("ist preload starting at {current_seqno}");
            preload_started = true;
        }

        match event.kind {
            EventKind::WriteSet => {
                let mut trx = ctx.pool.alloc();
                if event.is_empty() {
                    trx.mark_dummy(&event);
                } else {
                    trx.unserialize(&event);
                }
                ctx.handler.ist_trx(trx, must_apply, preload);
            }
            EventKind::ConfChange => {
                info!(
                    "ist conf change {current_seqno}, must_apply: {must_apply}, \
                     preload: {preload}"
                );
                ctx.handler.ist_cc(event, must_apply, preload);
            }
        }
    }

    if let Some(progress) = progress {
        progress.finish();
    }
    Ok(())
}

/// Throttled progress reports for long transfers.
struct Progress {
    total: i64,
    done: u64,
    since_report: u64,
    started: Instant,
    last_report: Instant,
}

impl Progress {
    fn new(total: i64) -> Self {
        info!("receiving ist events: 0/{total}");
        let now = Instant::now();
        Progress {
            total,
            done: 0,
            since_report: 0,
            started: now,
            last_report: now,
        }
    }

    fn update(&mut self, events: u64) {
        self.done += events;
        self.since_report += events;
        if self.since_report >= PROGRESS_MIN_EVENTS
            && self.last_report.elapsed() >= PROGRESS_MIN_INTERVAL
        {
            info!("receiving ist events: {}/{}", self.done, self.total);
            self.since_report = 0;
            self.last_report = Instant::now();
        }
    }

    fn finish(self) {
        info!(
            "receiving ist events done: {}/{} in {:.1?}",
            self.done + 1,
            self.total,
            self.started.elapsed()
        );
    }
}
