//! Packet context: the pooled object carrying one inbound packet through
//! header-bind → route → body-decode → handle → write-reply, and the
//! read-only views handlers receive.
//!
//! The internal [`Context`] is acquired from a per-peer [`ContextPool`] for
//! every inbound PULL/PUSH, reset on acquisition, and returned on every
//! exit path (including handler panics). Handlers never see it directly;
//! they get an owned [`PullCtx`] / [`PushCtx`] / [`UnknownCtx`] snapshot
//! cheap enough to move into the handler future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::codec::BodyCodec;
use crate::error::{Error, Result, Status, WireError};
use crate::protocol::{Header, Packet};
use crate::router::Handler;
use crate::session::Session;

/// Shared key/value map attached to sessions, contexts and pulls.
///
/// Values set by plugins on the session surface in every packet context of
/// that session via a copy taken at context acquisition.
#[derive(Clone, Default, Debug)]
pub struct PublicMap {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl PublicMap {
    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().expect("public map poisoned").get(key).cloned()
    }

    /// Insert or replace a value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .lock()
            .expect("public map poisoned")
            .insert(key.into(), value.into());
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("public map poisoned").len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deep copy with its own backing storage.
    pub fn snapshot(&self) -> PublicMap {
        let copied = self.inner.lock().expect("public map poisoned").clone();
        PublicMap {
            inner: Arc::new(Mutex::new(copied)),
        }
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => map.insert(k.to_string(), v.to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}

/// State shared by every handler-facing view of one packet.
#[derive(Clone)]
pub(crate) struct ViewShared {
    pub session: Session,
    pub uri: String,
    pub path: String,
    pub raw_query: String,
    pub public: PublicMap,
    pub input_codec: BodyCodec,
    pub reply_codec: Arc<Mutex<Option<BodyCodec>>>,
    query: Arc<OnceLock<HashMap<String, String>>>,
}

impl ViewShared {
    fn query(&self) -> &HashMap<String, String> {
        self.query.get_or_init(|| parse_query(&self.raw_query))
    }

    fn set_body_codec(&self, name: &str) -> Result<()> {
        let codec = BodyCodec::from_name(name)
            .ok_or_else(|| Error::Protocol(format!("unknown body codec {:?}", name)))?;
        *self.reply_codec.lock().expect("reply codec poisoned") = Some(codec);
        Ok(())
    }

    pub(crate) fn reply_codec_or_input(&self) -> BodyCodec {
        self.reply_codec
            .lock()
            .expect("reply codec poisoned")
            .unwrap_or(self.input_codec)
    }
}

macro_rules! view_accessors {
    () => {
        /// Full input URI, path plus optional query.
        pub fn uri(&self) -> &str {
            &self.shared.uri
        }

        /// Input URI path.
        pub fn path(&self) -> &str {
            &self.shared.path
        }

        /// Raw query string, without the leading `?`.
        pub fn raw_query(&self) -> &str {
            &self.shared.raw_query
        }

        /// Parsed query pairs; parsed once on first use.
        pub fn query(&self) -> &std::collections::HashMap<String, String> {
            self.shared.query()
        }

        /// One query value, if present.
        pub fn query_value(&self, key: &str) -> Option<&str> {
            self.shared.query().get(key).map(|s| s.as_str())
        }

        /// Remote address of the session carrying the packet.
        pub fn remote_addr(&self) -> String {
            self.shared.session.remote_addr()
        }

        /// The session carrying the packet.
        pub fn session(&self) -> &Session {
            &self.shared.session
        }

        /// The peer owning the session, while it is alive.
        pub fn peer(&self) -> Option<crate::peer::Peer> {
            self.shared.session.peer()
        }

        /// Public key/value map scoped to this packet.
        pub fn public(&self) -> &PublicMap {
            &self.shared.public
        }

        /// Name of the codec the input body was encoded with.
        pub fn body_codec(&self) -> &'static str {
            self.shared.input_codec.name()
        }
    };
}

/// Context view for PULL handlers.
#[derive(Clone)]
pub struct PullCtx {
    pub(crate) shared: ViewShared,
}

impl PullCtx {
    view_accessors!();

    /// Choose the codec for the reply body; defaults to the input codec.
    pub fn set_body_codec(&self, name: &str) -> Result<()> {
        self.shared.set_body_codec(name)
    }
}

/// Context view for PUSH handlers.
#[derive(Clone)]
pub struct PushCtx {
    pub(crate) shared: ViewShared,
}

impl PushCtx {
    view_accessors!();
}

/// Context view for unknown (catch-all) handlers: the route did not match,
/// so the body stays raw and may be re-bound to a typed value on demand.
#[derive(Clone)]
pub struct UnknownCtx {
    pub(crate) shared: ViewShared,
    pub(crate) body: Bytes,
}

impl UnknownCtx {
    view_accessors!();

    /// Raw input body bytes, transfer filters already unwound.
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Decode the raw body into a typed value with the input codec.
    /// Returns the codec name alongside the value.
    pub fn bind<T: serde::de::DeserializeOwned>(&self) -> Result<(&'static str, T)> {
        let codec = self.shared.input_codec;
        let value = codec.decode(&self.body)?;
        Ok((codec.name(), value))
    }

    /// Choose the codec for the reply body (unknown PULL only).
    pub fn set_body_codec(&self, name: &str) -> Result<()> {
        self.shared.set_body_codec(name)
    }
}

/// The pooled per-packet state. Crate-internal; handlers see views.
pub(crate) struct Context {
    pub session: Option<Session>,
    pub input: Option<Packet>,
    /// REPLY header under construction (PULL only).
    pub reply: Header,
    /// Encoded, filter-packed reply body (PULL only).
    pub reply_body: Vec<u8>,
    /// Filter-unwound input body.
    pub body: Bytes,
    pub handler: Option<Arc<Handler>>,
    pub public: PublicMap,
    pub path: String,
    pub raw_query: String,
    pub input_codec: BodyCodec,
    pub reply_codec: Arc<Mutex<Option<BodyCodec>>>,
    pub start: Instant,
    pub cost: Duration,
}

impl Context {
    fn empty() -> Box<Context> {
        Box::new(Context {
            session: None,
            input: None,
            reply: Header::new_push(0, "", BodyCodec::Json, Vec::new()),
            reply_body: Vec::new(),
            body: Bytes::new(),
            handler: None,
            public: PublicMap::default(),
            path: String::new(),
            raw_query: String::new(),
            input_codec: BodyCodec::Json,
            reply_codec: Arc::new(Mutex::new(None)),
            start: Instant::now(),
            cost: Duration::ZERO,
        })
    }

    /// Bind to a session and input packet; seeds the public map from the
    /// session's and stamps the start time.
    pub fn bind(&mut self, session: Session, input: Packet) {
        self.public = session.public().snapshot();
        self.session = Some(session);
        self.input = Some(input);
        self.start = Instant::now();
    }

    /// Reset for reuse. Clears back-references so a pooled context never
    /// keeps a session or handler alive.
    pub fn clean(&mut self) {
        self.session = None;
        self.input = None;
        self.reply = Header::new_push(0, "", BodyCodec::Json, Vec::new());
        self.reply_body.clear();
        self.body = Bytes::new();
        self.handler = None;
        self.public = PublicMap::default();
        self.path.clear();
        self.raw_query.clear();
        self.input_codec = BodyCodec::Json;
        self.reply_codec = Arc::new(Mutex::new(None));
        self.cost = Duration::ZERO;
    }

    /// Record a wire error as the reply status.
    pub fn set_reply_error(&mut self, err: &WireError) {
        self.reply.status_code = err.code();
        self.reply.status = err.text().to_string();
    }

    /// Whether no error status has been recorded yet.
    pub fn reply_ok(&self) -> bool {
        self.reply.status_code == 0 || self.reply.status_code == Status::OK.code()
    }

    fn view_shared(&self) -> ViewShared {
        let input = self.input.as_ref().expect("context not bound");
        ViewShared {
            session: self.session.clone().expect("context not bound"),
            uri: input.header.uri.clone(),
            path: self.path.clone(),
            raw_query: self.raw_query.clone(),
            public: self.public.clone(),
            input_codec: self.input_codec,
            reply_codec: self.reply_codec.clone(),
            query: Arc::new(OnceLock::new()),
        }
    }

    pub fn pull_view(&self) -> PullCtx {
        PullCtx {
            shared: self.view_shared(),
        }
    }

    pub fn push_view(&self) -> PushCtx {
        PushCtx {
            shared: self.view_shared(),
        }
    }

    pub fn unknown_view(&self) -> UnknownCtx {
        UnknownCtx {
            shared: self.view_shared(),
            body: self.body.clone(),
        }
    }
}

/// Per-peer pool of contexts.
///
/// Bounded; beyond the cap released contexts are dropped instead of
/// retained.
pub(crate) struct ContextPool {
    free: Mutex<Vec<Box<Context>>>,
}

const POOL_CAP: usize = 128;

impl ContextPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a context bound to the session and packet.
    pub fn acquire(&self, session: Session, input: Packet) -> Box<Context> {
        let mut ctx = self
            .free
            .lock()
            .expect("context pool poisoned")
            .pop()
            .unwrap_or_else(Context::empty);
        ctx.bind(session, input);
        ctx
    }

    /// Return a context after its packet is fully handled.
    pub fn release(&self, mut ctx: Box<Context>) {
        ctx.clean();
        let mut free = self.free.lock().expect("context pool poisoned");
        if free.len() < POOL_CAP {
            free.push(ctx);
        }
    }

    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.free.lock().expect("context pool poisoned").len()
    }
}
