//! Session: one connection's runtime state.
//!
//! A session owns the read loop for its connection, serializes writes
//! behind a mutex, correlates outstanding pulls to incoming replies, and
//! implements graceful close with in-flight quiescence. Dialed sessions
//! may redial on unexpected disconnect, preserving their identity.
//!
//! # Lifecycle
//!
//! ```text
//! Ok ──(close / I/O error / session age)──► Closing ──(quiescence)──► Closed
//! ```
//!
//! One read task per session; PULL/PUSH handlers run on spawned dispatch
//! tasks so the read loop never blocks on a handler. REPLY completion is
//! cheap and runs inline on the read task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::codec::BodyCodec;
use crate::context::{Context, PublicMap};
use crate::error::{Error, Result, Status, WireError};
use crate::peer::{Peer, PeerShared};
use crate::plugin::HookCtx;
use crate::protocol::{encode_frame, FrameBuffer, Header, Kind, Packet};
use crate::router::{normalize_path, PullOutcome, Thunk};
use crate::transport::{ReadHalf, Stream, WriteHalf};
use crate::xfer;

/// Grace applied while draining in-flight pulls on close when no context
/// age is configured.
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting pulls and pushes.
    Ok,
    /// Draining; no new pulls.
    Closing,
    /// Terminal.
    Closed,
}

/// Per-call options for [`Session::pull_with`] / [`Session::push_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOpts {
    /// Body codec name overriding the peer default.
    pub body_codec: Option<String>,
    /// Transfer-filter id stack applied to the body, in order.
    pub xfer: Vec<u8>,
    /// Pull deadline; the effective deadline is the minimum of this and
    /// the configured context age.
    pub deadline: Option<Duration>,
}

impl CallOpts {
    /// Options with the gzip filter on the body.
    pub fn gzip() -> Self {
        Self {
            xfer: vec![b'g'],
            ..Default::default()
        }
    }
}

/// A pending pull registered in the session's correlation table.
///
/// The completion closure owns the typed reply slot: it decodes the body
/// and signals the caller's one-shot channel. The entry is removed from
/// the table before the closure runs, which makes completion first-wins -
/// a second path finds nothing to complete.
pub(crate) struct PendingPull {
    complete: Box<dyn FnOnce(std::result::Result<(BodyCodec, Vec<u8>), WireError>) + Send>,
    public: PublicMap,
    start: Instant,
    uri: String,
}

/// An outstanding pull operation; await [`PullCmd::result`] for the reply.
#[derive(Debug)]
pub struct PullCmd<R> {
    rx: oneshot::Receiver<std::result::Result<R, WireError>>,
    seq: u32,
    uri: String,
    start: Instant,
    public: PublicMap,
}

impl<R> PullCmd<R> {
    /// Block until the pull completes.
    ///
    /// Yields exactly one of: the decoded reply, a wire error from the
    /// remote, CONN_CLOSED, or DEADLINE_EXCEEDED.
    pub async fn result(self) -> std::result::Result<R, WireError> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(WireError::new(Status::CONN_CLOSED)),
        }
    }

    /// Sequence number of the outbound PULL packet.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// URI of the outbound PULL packet.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Time elapsed since the pull was issued.
    pub fn cost(&self) -> Duration {
        self.start.elapsed()
    }

    /// Public key/value map attached to this pull.
    pub fn public(&self) -> &PublicMap {
        &self.public
    }
}

struct RedialInfo {
    addr: String,
    times: u32,
}

pub(crate) struct SessionInner {
    id: String,
    remote_addr: String,
    peer: Weak<PeerShared>,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<WriteHalf>>,
    seq: AtomicU32,
    pulls: Mutex<HashMap<u32, PendingPull>>,
    drained: Notify,
    closed: Notify,
    created_at: Mutex<Instant>,
    public: PublicMap,
    redial: Option<RedialInfo>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one connection's runtime state. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        peer: Weak<PeerShared>,
        id: String,
        stream: Stream,
        redial: Option<(String, u32)>,
    ) -> (Session, ReadHalf) {
        let remote_addr = stream.remote_addr();
        let (reader, writer) = stream.into_split();
        let sess = Session {
            inner: Arc::new(SessionInner {
                id,
                remote_addr,
                peer,
                state: Mutex::new(SessionState::Ok),
                writer: tokio::sync::Mutex::new(Some(writer)),
                seq: AtomicU32::new(0),
                pulls: Mutex::new(HashMap::new()),
                drained: Notify::new(),
                closed: Notify::new(),
                created_at: Mutex::new(Instant::now()),
                public: PublicMap::default(),
                redial: redial.map(|(addr, times)| RedialInfo { addr, times }),
                read_task: Mutex::new(None),
            }),
        };
        (sess, reader)
    }

    /// A session with no socket and no peer, for unit tests of components
    /// that only need the handle surface.
    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Session {
        Session {
            inner: Arc::new(SessionInner {
                id: "test".to_string(),
                remote_addr: "test:0".to_string(),
                peer: Weak::new(),
                state: Mutex::new(SessionState::Ok),
                writer: tokio::sync::Mutex::new(None),
                seq: AtomicU32::new(0),
                pulls: Mutex::new(HashMap::new()),
                drained: Notify::new(),
                closed: Notify::new(),
                created_at: Mutex::new(Instant::now()),
                public: PublicMap::default(),
                redial: None,
                read_task: Mutex::new(None),
            }),
        }
    }

    /// Session identifier, unique within its peer.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Printable remote address.
    pub fn remote_addr(&self) -> String {
        self.inner.remote_addr.clone()
    }

    /// Whether the session is accepting operations.
    pub fn health(&self) -> bool {
        *self.inner.state.lock().expect("state poisoned") == SessionState::Ok
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("state poisoned")
    }

    /// Session-scoped public key/value map; seeds each packet context.
    pub fn public(&self) -> &PublicMap {
        &self.inner.public
    }

    /// The owning peer, while it is alive.
    pub fn peer(&self) -> Option<Peer> {
        self.inner.peer.upgrade().map(Peer::from_shared)
    }

    fn peer_shared(&self) -> Result<Arc<PeerShared>> {
        self.inner.peer.upgrade().ok_or(Error::ConnectionClosed)
    }

    /// Issue a PULL with default options.
    pub async fn pull<A, R>(&self, uri: &str, arg: &A) -> Result<PullCmd<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.pull_with(uri, arg, CallOpts::default()).await
    }

    /// Issue a PULL: allocate a sequence, write the packet, register the
    /// pending entry, and return. Await the returned [`PullCmd`] for the
    /// reply. Fails fast with `ConnectionClosed` unless the session is Ok.
    pub async fn pull_with<A, R>(&self, uri: &str, arg: &A, opts: CallOpts) -> Result<PullCmd<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        if !self.health() {
            return Err(Error::ConnectionClosed);
        }
        let peer = self.peer_shared()?;
        let codec = self.resolve_codec(&peer, opts.body_codec.as_deref())?;
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let header = Header::new_pull(seq, uri, codec, opts.xfer.clone());
        let public = self.inner.public.snapshot();
        let start = Instant::now();
        let plugins = peer.plugins();

        {
            let hook = HookCtx {
                session: self,
                header: &header,
                public: &public,
            };
            plugins.pre_write_pull(&hook).map_err(Error::Wire)?;
        }

        let body = codec.encode(arg)?;
        let body = xfer::pack(&header.xfer, body).map_err(Error::Wire)?;

        let (tx, rx) = oneshot::channel::<std::result::Result<R, WireError>>();
        let complete = Box::new(
            move |res: std::result::Result<(BodyCodec, Vec<u8>), WireError>| {
                let out = match res {
                    Ok((codec, bytes)) => codec
                        .decode::<R>(&bytes)
                        .map_err(|e| WireError::with_cause(Status::BAD_PACKET, e)),
                    Err(e) => Err(e),
                };
                let _ = tx.send(out);
            },
        );

        // Registered before the write so a fast reply cannot miss the table.
        self.inner.pulls.lock().expect("pulls poisoned").insert(
            seq,
            PendingPull {
                complete,
                public: public.clone(),
                start,
                uri: uri.to_string(),
            },
        );

        if let Err(e) = self.write_packet(&header, peer.header_codec(), &body).await {
            if let Some(pending) = self.take_pull(seq) {
                (pending.complete)(Err(WireError::with_cause(Status::WRITE_FAILED, &e)));
            }
            self.spawn_close();
        } else {
            let hook_err = {
                let hook = HookCtx {
                    session: self,
                    header: &header,
                    public: &public,
                };
                plugins.post_write_pull(&hook).err()
            };
            if let Some(e) = hook_err {
                if let Some(pending) = self.take_pull(seq) {
                    (pending.complete)(Err(e));
                }
            }

            let deadline = match (opts.deadline, peer.config.context_age()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if let Some(d) = deadline {
                let sess = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(d).await;
                    if let Some(pending) = sess.take_pull(seq) {
                        tracing::debug!(seq, uri = %pending.uri, "pull deadline exceeded");
                        (pending.complete)(Err(WireError::new(Status::DEADLINE_EXCEEDED)));
                    }
                });
            }
        }

        Ok(PullCmd {
            rx,
            seq,
            uri: uri.to_string(),
            start,
            public,
        })
    }

    /// Send a PUSH with default options.
    pub async fn push<A>(&self, uri: &str, arg: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        self.push_with(uri, arg, CallOpts::default()).await
    }

    /// Send a PUSH: fire and forget. Returns once the packet is written;
    /// no correlation entry is kept.
    pub async fn push_with<A>(&self, uri: &str, arg: &A, opts: CallOpts) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        if !self.health() {
            return Err(Error::ConnectionClosed);
        }
        let peer = self.peer_shared()?;
        let codec = self.resolve_codec(&peer, opts.body_codec.as_deref())?;
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let header = Header::new_push(seq, uri, codec, opts.xfer.clone());

        let body = codec.encode(arg)?;
        let body = xfer::pack(&header.xfer, body).map_err(Error::Wire)?;

        let start = Instant::now();
        if let Err(e) = self.write_packet(&header, peer.header_codec(), &body).await {
            self.spawn_close();
            return Err(e);
        }
        self.runlog("push-out", uri, start.elapsed(), Status::OK.code(), Some(&body));
        Ok(())
    }

    /// Graceful close: stop accepting pulls, drain in-flight pulls within
    /// the grace window, cancel the remainder with CONN_CLOSED, close the
    /// socket. Idempotent; concurrent callers wait for the first.
    pub async fn close(&self) -> Result<()> {
        let first = {
            let mut st = self.inner.state.lock().expect("state poisoned");
            match *st {
                SessionState::Closed => return Ok(()),
                SessionState::Closing => false,
                SessionState::Ok => {
                    *st = SessionState::Closing;
                    true
                }
            }
        };
        if !first {
            self.wait_closed().await;
            return Ok(());
        }

        let grace = self
            .inner
            .peer
            .upgrade()
            .and_then(|p| p.config.context_age())
            .unwrap_or(DEFAULT_CLOSE_GRACE);
        let _ = tokio::time::timeout(grace, self.wait_pulls_drained()).await;
        self.fail_pending(Status::CONN_CLOSED);

        if let Some(handle) = self.inner.read_task.lock().expect("read task poisoned").take() {
            handle.abort();
        }
        {
            let mut guard = self.inner.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        }

        *self.inner.state.lock().expect("state poisoned") = SessionState::Closed;
        self.inner.closed.notify_waiters();
        if let Some(peer) = self.inner.peer.upgrade() {
            peer.remove_session(&self.inner.id);
        }
        tracing::debug!(id = %self.inner.id, "session closed");
        Ok(())
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.inner.closed.notified();
            tokio::pin!(notified);
            // Register before checking, so a notify between check and
            // await cannot be lost.
            notified.as_mut().enable();
            if *self.inner.state.lock().expect("state poisoned") == SessionState::Closed {
                return;
            }
            notified.await;
        }
    }

    async fn wait_pulls_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pulls.lock().expect("pulls poisoned").is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Remove one pending pull; first caller wins.
    fn take_pull(&self, seq: u32) -> Option<PendingPull> {
        let entry = self.inner.pulls.lock().expect("pulls poisoned").remove(&seq);
        if entry.is_some() {
            self.inner.drained.notify_waiters();
        }
        entry
    }

    /// Fail every pending pull with the given status.
    fn fail_pending(&self, status: Status) {
        let entries: Vec<PendingPull> = {
            let mut pulls = self.inner.pulls.lock().expect("pulls poisoned");
            pulls.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            (entry.complete)(Err(WireError::new(status)));
        }
        self.inner.drained.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.pulls.lock().expect("pulls poisoned").len()
    }

    fn resolve_codec(&self, peer: &PeerShared, name: Option<&str>) -> Result<BodyCodec> {
        match name {
            None | Some("") => Ok(peer.default_codec),
            Some(name) => BodyCodec::from_name(name)
                .ok_or_else(|| Error::Protocol(format!("unknown body codec {:?}", name))),
        }
    }

    /// Serialize one packet onto the socket. The mutex is held across the
    /// whole write; packets never interleave.
    pub(crate) async fn write_packet(
        &self,
        header: &Header,
        header_codec: BodyCodec,
        body: &[u8],
    ) -> Result<()> {
        let frame = encode_frame(header, header_codec, body)?;
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// A write failure poisons the connection; close in the background.
    fn spawn_close(&self) {
        let sess = self.clone();
        tokio::spawn(async move {
            let _ = sess.close().await;
        });
    }

    /// Spawn the read task (with redial wrapper) and the session-age timer.
    pub(crate) fn start(&self, reader: ReadHalf) {
        let sess = self.clone();
        let handle = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match sess.read_loop(&mut reader).await {
                    Ok(()) => tracing::debug!(id = %sess.inner.id, "connection closed by remote"),
                    Err(e) => {
                        tracing::error!(id = %sess.inner.id, error = %e, "read loop terminated")
                    }
                }
                if sess.health() {
                    if let Some(new_reader) = sess.try_redial().await {
                        reader = new_reader;
                        continue;
                    }
                    // Don't abort ourselves out of the close path.
                    sess.inner
                        .read_task
                        .lock()
                        .expect("read task poisoned")
                        .take();
                    let _ = sess.close().await;
                }
                break;
            }
        });
        *self.inner.read_task.lock().expect("read task poisoned") = Some(handle);

        if let Some(age) = self
            .inner
            .peer
            .upgrade()
            .and_then(|p| p.config.session_age())
        {
            let sess = self.clone();
            tokio::spawn(async move {
                loop {
                    let deadline = *sess.inner.created_at.lock().expect("created_at poisoned") + age;
                    let now = Instant::now();
                    if now >= deadline {
                        if sess.health() {
                            tracing::info!(id = %sess.inner.id, "session age limit reached, closing");
                            let _ = sess.close().await;
                        }
                        return;
                    }
                    tokio::time::sleep(deadline - now).await;
                }
            });
        }
    }

    async fn read_loop(&self, reader: &mut ReadHalf) -> Result<()> {
        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            for pkt in frames.push(&buf[..n])? {
                self.handle_packet(pkt);
            }
        }
    }

    /// After an unexpected disconnect, attempt to replace the connection.
    /// All pending pulls fail with CONN_CLOSED before any new pull may use
    /// the session; the sequence counter and session age restart.
    async fn try_redial(&self) -> Option<ReadHalf> {
        let info = self.inner.redial.as_ref()?;
        if info.times == 0 {
            return None;
        }
        let peer = self.inner.peer.upgrade()?;
        self.fail_pending(Status::CONN_CLOSED);

        for attempt in 1..=info.times {
            let dial = Stream::dial(peer.config.network, &info.addr);
            let result = match peer.config.dial_timeout() {
                Some(t) => match tokio::time::timeout(t, dial).await {
                    Ok(r) => r,
                    Err(_) => Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "dial timed out",
                    ))),
                },
                None => dial.await,
            };
            match result {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    *self.inner.writer.lock().await = Some(writer);
                    self.inner.seq.store(0, Ordering::Relaxed);
                    *self.inner.created_at.lock().expect("created_at poisoned") = Instant::now();
                    tracing::warn!(id = %self.inner.id, addr = %info.addr, attempt, "redialed");
                    return Some(reader);
                }
                Err(e) => {
                    tracing::warn!(id = %self.inner.id, attempt, error = %e, "redial failed");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }
        None
    }

    /// Route one inbound packet. Runs on the read task; must stay cheap.
    fn handle_packet(&self, pkt: Packet) {
        match pkt.kind() {
            Some(Kind::Reply) => self.handle_reply(pkt),
            Some(Kind::Pull) => self.bind_pull(pkt),
            Some(Kind::Push) => self.bind_push(pkt),
            None => {
                tracing::error!(
                    id = %self.inner.id,
                    kind = pkt.header.kind,
                    status = %Status::UNSUPPORTED_TX,
                    "unsupported packet kind, closing session"
                );
                self.spawn_close();
            }
        }
    }

    /// Complete a pending pull from an inbound REPLY. Inline on the read
    /// task; completion is cheap.
    fn handle_reply(&self, pkt: Packet) {
        let Some(entry) = self.take_pull(pkt.seq()) else {
            tracing::debug!(id = %self.inner.id, seq = pkt.seq(), "reply for unknown sequence, dropping");
            return;
        };
        let PendingPull {
            complete,
            public,
            start,
            uri,
        } = entry;
        let cost = start.elapsed();

        let Some(peer) = self.inner.peer.upgrade() else {
            complete(Err(WireError::new(Status::CONN_CLOSED)));
            return;
        };
        let plugins = peer.plugins();

        let hook_err = {
            let hook = HookCtx {
                session: self,
                header: &pkt.header,
                public: &public,
            };
            plugins
                .post_read_reply_header(&hook)
                .and_then(|_| plugins.pre_read_reply_body(&hook))
                .err()
        };
        if let Some(e) = hook_err {
            complete(Err(e));
            return;
        }

        if pkt.header.status_code != Status::OK.code() {
            let status = pkt.header.status_code;
            complete(Err(WireError::from_header(status, pkt.header.status.clone())));
            self.runlog("pull", &uri, cost, status, None);
            return;
        }

        let codec = match BodyCodec::from_name(&pkt.header.body_codec) {
            Some(c) => c,
            None if pkt.header.body_codec.is_empty() => peer.default_codec,
            None => {
                complete(Err(WireError::with_cause(
                    Status::BAD_PACKET,
                    format!("unknown body codec {:?}", pkt.header.body_codec),
                )));
                return;
            }
        };

        match xfer::unpack(&pkt.header.xfer, &pkt.body) {
            Err(e) => complete(Err(e)),
            Ok(bytes) => {
                let hook_err = {
                    let hook = HookCtx {
                        session: self,
                        header: &pkt.header,
                        public: &public,
                    };
                    plugins.post_read_reply_body(&hook).err()
                };
                if let Some(e) = hook_err {
                    complete(Err(e));
                } else {
                    complete(Ok((codec, bytes)));
                    self.runlog("pull", &uri, cost, Status::OK.code(), Some(&pkt.body));
                }
            }
        }
    }

    /// Bind an inbound PULL: prepare the reply header, run header hooks,
    /// resolve the route, unwind filters, then hand off to a dispatch task.
    /// Error statuses recorded here still flow through dispatch so the
    /// REPLY is written and hooks fire.
    fn bind_pull(&self, pkt: Packet) {
        let Some(peer) = self.inner.peer.upgrade() else {
            return;
        };
        let header_codec = pkt.header_codec;
        let mut ctx = peer.pool.acquire(self.clone(), pkt);
        let input_header = ctx.input.as_ref().expect("just bound").header.clone();
        ctx.reply = Header::reply_to(&input_header);

        let mut chain = peer.plugins();

        let hook_err = {
            let hook = HookCtx {
                session: self,
                header: &input_header,
                public: &ctx.public,
            };
            chain.post_read_pull_header(&hook).err()
        };
        if let Some(e) = hook_err {
            ctx.set_reply_error(&e);
            self.spawn_pull_dispatch(ctx, chain, header_codec);
            return;
        }

        let (path, raw_query) = input_header.split_uri();
        if !path.starts_with('/') {
            ctx.set_reply_error(&WireError::new(Status::BAD_URI));
            self.spawn_pull_dispatch(ctx, chain, header_codec);
            return;
        }
        ctx.path = normalize_path(path);
        ctx.raw_query = raw_query.to_string();

        match peer.pull_router().get(&ctx.path) {
            Some(handler) => {
                if handler.is_unknown {
                    tracing::debug!(path = %ctx.path, "routing pull to unknown handler");
                }
                chain = handler.plugins.clone();
                ctx.handler = Some(handler);
            }
            None => {
                ctx.set_reply_error(&WireError::new(Status::NOT_FOUND));
                self.spawn_pull_dispatch(ctx, chain, header_codec);
                return;
            }
        }

        match BodyCodec::from_name(&input_header.body_codec) {
            Some(c) => ctx.input_codec = c,
            None if input_header.body_codec.is_empty() => ctx.input_codec = peer.default_codec,
            None => {
                ctx.set_reply_error(&WireError::with_cause(
                    Status::BAD_PACKET,
                    format!("unknown body codec {:?}", input_header.body_codec),
                ));
                self.spawn_pull_dispatch(ctx, chain, header_codec);
                return;
            }
        }

        let hook_err = {
            let hook = HookCtx {
                session: self,
                header: &input_header,
                public: &ctx.public,
            };
            chain.pre_read_pull_body(&hook).err()
        };
        if let Some(e) = hook_err {
            ctx.set_reply_error(&e);
            self.spawn_pull_dispatch(ctx, chain, header_codec);
            return;
        }

        match xfer::unpack(&input_header.xfer, &ctx.input.as_ref().expect("bound").body) {
            Ok(bytes) => ctx.body = bytes.into(),
            Err(e) => ctx.set_reply_error(&e),
        }

        self.spawn_pull_dispatch(ctx, chain, header_codec);
    }

    fn spawn_pull_dispatch(
        &self,
        ctx: Box<Context>,
        chain: Arc<crate::plugin::PluginContainer>,
        header_codec: BodyCodec,
    ) {
        let sess = self.clone();
        tokio::spawn(async move {
            sess.dispatch_pull(ctx, chain, header_codec).await;
        });
    }

    /// Worker half of PULL handling: body hook, handler invocation (panic
    /// isolated), reply encode, reply write, run log, context release.
    async fn dispatch_pull(
        &self,
        mut ctx: Box<Context>,
        chain: Arc<crate::plugin::PluginContainer>,
        header_codec: BodyCodec,
    ) {
        let input_header = ctx.input.as_ref().expect("bound").header.clone();

        if ctx.reply_ok() {
            let hook_err = {
                let hook = HookCtx {
                    session: self,
                    header: &input_header,
                    public: &ctx.public,
                };
                chain.post_read_pull_body(&hook).err()
            };
            if let Some(e) = hook_err {
                ctx.set_reply_error(&e);
            } else if let Some(handler) = ctx.handler.clone() {
                let invoked = match &handler.thunk {
                    Thunk::Pull(f) => {
                        AssertUnwindSafe(f(ctx.pull_view(), ctx.body.clone()))
                            .catch_unwind()
                            .await
                    }
                    Thunk::UnknownPull(f) => {
                        AssertUnwindSafe(f(ctx.unknown_view())).catch_unwind().await
                    }
                    _ => Ok(PullOutcome::err(WireError::new(
                        Status::INTERNAL_SERVER_ERROR,
                    ))),
                };
                match invoked {
                    Err(panic) => {
                        tracing::error!(
                            uri = %input_header.uri,
                            panic = %panic_message(&panic),
                            "pull handler panicked"
                        );
                        ctx.set_reply_error(&WireError::new(Status::INTERNAL_SERVER_ERROR));
                    }
                    Ok(outcome) => match outcome.err {
                        Some(e) => ctx.set_reply_error(&e),
                        None => {
                            ctx.reply.body_codec = outcome.codec.name().to_string();
                            match xfer::pack(&ctx.reply.xfer, outcome.body) {
                                Ok(bytes) => ctx.reply_body = bytes,
                                Err(e) => ctx.set_reply_error(&e),
                            }
                        }
                    },
                }
            }
        }

        if ctx.reply_ok() {
            ctx.reply.status_code = Status::OK.code();
            ctx.reply.status = Status::OK.text().to_string();
        } else {
            // Error replies carry no body.
            ctx.reply_body.clear();
        }

        {
            let hook = HookCtx {
                session: self,
                header: &ctx.reply,
                public: &ctx.public,
            };
            if let Err(e) = chain.pre_write_reply(&hook) {
                tracing::warn!(error = %e, "pre_write_reply hook failed");
            }
        }

        if let Err(e) = self
            .write_packet(&ctx.reply, header_codec, &ctx.reply_body)
            .await
        {
            tracing::error!(
                uri = %input_header.uri,
                seq = input_header.seq,
                error = %e,
                "reply write failed"
            );
            ctx.reply.status_code = Status::WRITE_FAILED.code();
            ctx.reply.status = Status::WRITE_FAILED.text().to_string();
            self.spawn_close();
        } else {
            let hook = HookCtx {
                session: self,
                header: &ctx.reply,
                public: &ctx.public,
            };
            if let Err(e) = chain.post_write_reply(&hook) {
                tracing::warn!(error = %e, "post_write_reply hook failed");
            }
        }

        ctx.cost = ctx.start.elapsed();
        self.runlog(
            "pull-serve",
            &input_header.uri,
            ctx.cost,
            ctx.reply.status_code,
            Some(&ctx.reply_body),
        );
        if let Some(peer) = self.inner.peer.upgrade() {
            peer.pool.release(ctx);
        }
    }

    /// Bind an inbound PUSH. Failures drop the packet silently (logged);
    /// a PUSH never produces a reply.
    fn bind_push(&self, pkt: Packet) {
        let Some(peer) = self.inner.peer.upgrade() else {
            return;
        };
        let mut ctx = peer.pool.acquire(self.clone(), pkt);
        let input_header = ctx.input.as_ref().expect("just bound").header.clone();

        let mut chain = peer.plugins();

        let hook_failed = {
            let hook = HookCtx {
                session: self,
                header: &input_header,
                public: &ctx.public,
            };
            chain.post_read_push_header(&hook).is_err()
        };
        if hook_failed {
            peer.pool.release(ctx);
            return;
        }

        let (path, raw_query) = input_header.split_uri();
        if !path.starts_with('/') {
            tracing::warn!(uri = %input_header.uri, "push with bad uri, dropping");
            peer.pool.release(ctx);
            return;
        }
        ctx.path = normalize_path(path);
        ctx.raw_query = raw_query.to_string();

        match peer.push_router().get(&ctx.path) {
            Some(handler) => {
                if handler.is_unknown {
                    tracing::debug!(path = %ctx.path, "routing push to unknown handler");
                }
                chain = handler.plugins.clone();
                ctx.handler = Some(handler);
            }
            None => {
                tracing::debug!(path = %ctx.path, "push route not found, dropping");
                peer.pool.release(ctx);
                return;
            }
        }

        match BodyCodec::from_name(&input_header.body_codec) {
            Some(c) => ctx.input_codec = c,
            None if input_header.body_codec.is_empty() => ctx.input_codec = peer.default_codec,
            None => {
                tracing::warn!(codec = %input_header.body_codec, "push with unknown codec, dropping");
                peer.pool.release(ctx);
                return;
            }
        }

        let hook_failed = {
            let hook = HookCtx {
                session: self,
                header: &input_header,
                public: &ctx.public,
            };
            chain.pre_read_push_body(&hook).is_err()
        };
        if hook_failed {
            peer.pool.release(ctx);
            return;
        }

        match xfer::unpack(&input_header.xfer, &ctx.input.as_ref().expect("bound").body) {
            Ok(bytes) => ctx.body = bytes.into(),
            Err(e) => {
                tracing::warn!(error = %e, "push body unpack failed, dropping");
                peer.pool.release(ctx);
                return;
            }
        }

        let sess = self.clone();
        tokio::spawn(async move {
            sess.dispatch_push(ctx, chain).await;
        });
    }

    /// Worker half of PUSH handling: body hook, handler invocation (panic
    /// isolated and swallowed), run log, context release.
    async fn dispatch_push(&self, ctx: Box<Context>, chain: Arc<crate::plugin::PluginContainer>) {
        let input_header = ctx.input.as_ref().expect("bound").header.clone();

        let hook_failed = {
            let hook = HookCtx {
                session: self,
                header: &input_header,
                public: &ctx.public,
            };
            chain.post_read_push_body(&hook).is_err()
        };
        if !hook_failed {
            if let Some(handler) = ctx.handler.clone() {
                let invoked = match &handler.thunk {
                    Thunk::Push(f) => {
                        AssertUnwindSafe(f(ctx.push_view(), ctx.body.clone()))
                            .catch_unwind()
                            .await
                    }
                    Thunk::UnknownPush(f) => {
                        AssertUnwindSafe(f(ctx.unknown_view())).catch_unwind().await
                    }
                    _ => Ok(None),
                };
                match invoked {
                    Err(panic) => tracing::error!(
                        uri = %input_header.uri,
                        panic = %panic_message(&panic),
                        "push handler panicked"
                    ),
                    Ok(Some(e)) => {
                        tracing::warn!(uri = %input_header.uri, error = %e, "push handler failed")
                    }
                    Ok(None) => {}
                }
            }
        }

        let cost = ctx.start.elapsed();
        self.runlog("push-serve", &input_header.uri, cost, 0, Some(&ctx.body));
        if let Some(peer) = self.inner.peer.upgrade() {
            peer.pool.release(ctx);
        }
    }

    /// Operation log honoring `count_time`, `print_body` and
    /// `slow_comet_duration`.
    fn runlog(&self, op: &str, uri: &str, cost: Duration, status: u16, body: Option<&[u8]>) {
        let Some(peer) = self.inner.peer.upgrade() else {
            return;
        };
        let cfg = &peer.config;

        let slow = cfg.slow_comet().is_some_and(|t| cost >= t);
        let rendered_body = if cfg.print_body {
            body.map(render_body)
        } else {
            None
        };

        if slow {
            tracing::warn!(
                op,
                uri,
                status,
                cost_ms = cost.as_millis() as u64,
                body = rendered_body.as_deref().unwrap_or(""),
                "slow operation"
            );
        } else if cfg.count_time {
            tracing::info!(
                op,
                uri,
                status,
                cost_ms = cost.as_millis() as u64,
                body = rendered_body.as_deref().unwrap_or(""),
                "operation"
            );
        } else if cfg.print_body {
            tracing::info!(op, uri, status, body = rendered_body.as_deref().unwrap_or(""), "operation");
        }
    }
}

/// Lossy, truncated body rendering for logs.
fn render_body(body: &[u8]) -> String {
    const MAX: usize = 256;
    let text = String::from_utf8_lossy(&body[..body.len().min(MAX)]);
    if body.len() > MAX {
        format!("{}... ({} bytes)", text, body.len())
    } else {
        text.into_owned()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_session_surface() {
        let sess = Session::detached_for_tests();
        assert_eq!(sess.id(), "test");
        assert!(sess.health());
        assert_eq!(sess.state(), SessionState::Ok);
        assert!(sess.peer().is_none());
    }

    #[test]
    fn test_take_pull_is_first_wins() {
        let sess = Session::detached_for_tests();
        let (tx, _rx) = oneshot::channel::<std::result::Result<(), WireError>>();
        let complete = Box::new(move |res: std::result::Result<(BodyCodec, Vec<u8>), WireError>| {
            let _ = tx.send(res.map(|_| ()));
        });
        sess.inner.pulls.lock().unwrap().insert(
            1,
            PendingPull {
                complete,
                public: PublicMap::default(),
                start: Instant::now(),
                uri: "/x".into(),
            },
        );

        assert!(sess.take_pull(1).is_some());
        assert!(sess.take_pull(1).is_none());
        assert_eq!(sess.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fail_pending_completes_with_status() {
        let sess = Session::detached_for_tests();
        let (tx, rx) = oneshot::channel::<std::result::Result<(), WireError>>();
        let complete = Box::new(move |res: std::result::Result<(BodyCodec, Vec<u8>), WireError>| {
            let _ = tx.send(res.map(|_| ()));
        });
        sess.inner.pulls.lock().unwrap().insert(
            9,
            PendingPull {
                complete,
                public: PublicMap::default(),
                start: Instant::now(),
                uri: "/x".into(),
            },
        );

        sess.fail_pending(Status::CONN_CLOSED);
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is(Status::CONN_CLOSED));
        assert_eq!(sess.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_pull_cmd_conn_closed_on_dropped_sender() {
        let (tx, rx) = oneshot::channel::<std::result::Result<i32, WireError>>();
        drop(tx);
        let cmd = PullCmd {
            rx,
            seq: 1,
            uri: "/x".into(),
            start: Instant::now(),
            public: PublicMap::default(),
        };
        let err = cmd.result().await.unwrap_err();
        assert!(err.is(Status::CONN_CLOSED));
    }

    #[tokio::test]
    async fn test_pull_on_detached_session_fails_fast() {
        let sess = Session::detached_for_tests();
        // Healthy but no peer: the weak upgrade fails.
        let err = sess.pull::<_, i32>("/x", &1i32).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn test_render_body_truncates() {
        let long = vec![b'a'; 1000];
        let rendered = render_body(&long);
        assert!(rendered.contains("1000 bytes"));
        let short = render_body(b"short");
        assert_eq!(short, "short");
    }

    #[test]
    fn test_panic_message_forms() {
        let s: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*s), "static str");
        let s: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*s), "owned");
        let s: Box<dyn std::any::Any + Send> = Box::new(42i32);
        assert_eq!(panic_message(&*s), "non-string panic payload");
    }
}
