//! Peer: the top-level object.
//!
//! A peer may act as server (accepting inbound connections on its listen
//! address) and client (dialing outbound connections) at the same time; a
//! session behaves identically either way. The peer owns the
//! configuration, the PULL and PUSH routers, the plugin chain, the context
//! pool, and the set of live sessions, and coordinates global shutdown.
//!
//! # Example
//!
//! ```ignore
//! let peer = Peer::new(PeerConfig {
//!     listen_address: "127.0.0.1:9090".to_string(),
//!     ..Default::default()
//! })?;
//! peer.route_pull(
//!     PullGroup::new("/math").handler("Add", |_ctx, args: Vec<i64>| async move {
//!         Ok(args.iter().sum::<i64>())
//!     }),
//! )?;
//! peer.listen().await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

use crate::codec::BodyCodec;
use crate::config::PeerConfig;
use crate::context::{ContextPool, UnknownCtx};
use crate::error::{Error, Result, WireError};
use crate::plugin::{Plugin, PluginContainer};
use crate::router::{unknown_pull_handler, unknown_push_handler, PullGroup, PushGroup, Router};
use crate::session::Session;
use crate::transport::{Listener, Stream};

/// Bound on how long `close()` waits for sessions to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Ok,
    Closing,
    Closed,
}

pub(crate) struct PeerShared {
    pub config: PeerConfig,
    pub default_codec: BodyCodec,
    pub pool: ContextPool,
    /// Header codec for outbound frames (the wire-proto variant byte).
    header_codec: Mutex<BodyCodec>,
    pull_router: RwLock<Router>,
    push_router: RwLock<Router>,
    plugins: RwLock<Arc<PluginContainer>>,
    sessions: Mutex<HashMap<String, Session>>,
    state: Mutex<PeerState>,
    local_addr: Mutex<Option<String>>,
    shutdown: Notify,
    session_seq: AtomicU64,
}

impl PeerShared {
    /// Snapshot of the peer-level plugin chain.
    pub fn plugins(&self) -> Arc<PluginContainer> {
        self.plugins.read().expect("plugins poisoned").clone()
    }

    /// Header codec for frames this peer originates.
    pub fn header_codec(&self) -> BodyCodec {
        *self.header_codec.lock().expect("header codec poisoned")
    }

    /// Read access to the PULL router.
    pub fn pull_router(&self) -> RwLockReadGuard<'_, Router> {
        self.pull_router.read().expect("pull router poisoned")
    }

    /// Read access to the PUSH router.
    pub fn push_router(&self) -> RwLockReadGuard<'_, Router> {
        self.push_router.read().expect("push router poisoned")
    }

    pub fn remove_session(&self, id: &str) {
        self.sessions.lock().expect("sessions poisoned").remove(id);
    }

    fn insert_session(&self, sess: Session) {
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .insert(sess.id().to_string(), sess);
    }
}

/// The top-level peer object. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Validate the configuration and construct a peer.
    pub fn new(mut config: PeerConfig) -> Result<Peer> {
        config.check()?;
        let default_codec = BodyCodec::from_name(&config.default_body_codec)
            .expect("check() validated the codec name");
        Ok(Peer {
            shared: Arc::new(PeerShared {
                config,
                default_codec,
                pool: ContextPool::new(),
                header_codec: Mutex::new(BodyCodec::Json),
                pull_router: RwLock::new(Router::default()),
                push_router: RwLock::new(Router::default()),
                plugins: RwLock::new(Arc::new(PluginContainer::new())),
                sessions: Mutex::new(HashMap::new()),
                state: Mutex::new(PeerState::Ok),
                local_addr: Mutex::new(None),
                shutdown: Notify::new(),
                session_seq: AtomicU64::new(0),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<PeerShared>) -> Peer {
        Peer { shared }
    }

    /// The peer's configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    /// Choose the wire proto for frames this peer originates, by header
    /// codec name. Inbound frames of either proto are always accepted;
    /// replies mirror the proto of the request.
    pub fn set_default_proto(&self, codec_name: &str) -> Result<()> {
        let codec = BodyCodec::from_name(codec_name)
            .ok_or_else(|| Error::Config(format!("unknown header codec {:?}", codec_name)))?;
        *self
            .shared
            .header_codec
            .lock()
            .expect("header codec poisoned") = codec;
        Ok(())
    }

    /// Append a plugin to the peer chain.
    ///
    /// Call before registering routes: the effective per-handler chain is
    /// merged at registration time.
    pub fn plugin(&self, plugin: impl Plugin) {
        let mut guard = self.shared.plugins.write().expect("plugins poisoned");
        let mut chain = (**guard).clone();
        chain.add(plugin);
        *guard = Arc::new(chain);
    }

    /// Register a tree of PULL handlers.
    pub fn route_pull(&self, group: PullGroup) -> Result<()> {
        let base = self.shared.plugins();
        self.shared
            .pull_router
            .write()
            .expect("pull router poisoned")
            .register_pull_group(group, &base)
    }

    /// Register a tree of PUSH handlers.
    pub fn route_push(&self, group: PushGroup) -> Result<()> {
        let base = self.shared.plugins();
        self.shared
            .push_router
            .write()
            .expect("push router poisoned")
            .register_push_group(group, &base)
    }

    /// Install the catch-all PULL handler, invoked with raw body bytes
    /// when no exact route matches.
    pub fn set_unknown_pull<R, F, Fut>(&self, f: F) -> Result<()>
    where
        R: Serialize + Send + 'static,
        F: Fn(UnknownCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, WireError>> + Send + 'static,
    {
        let handler = unknown_pull_handler(f, self.shared.plugins());
        self.shared
            .pull_router
            .write()
            .expect("pull router poisoned")
            .set_unknown(handler)
    }

    /// Install the catch-all PUSH handler.
    pub fn set_unknown_push<F, Fut>(&self, f: F) -> Result<()>
    where
        F: Fn(UnknownCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WireError>> + Send + 'static,
    {
        let handler = unknown_push_handler(f, self.shared.plugins());
        self.shared
            .push_router
            .write()
            .expect("push router poisoned")
            .set_unknown(handler)
    }

    /// Dial a remote peer.
    ///
    /// Applies the configured dial timeout; runs `post_dial` plugins on
    /// the established session; starts its read loop. With `redial_times`
    /// configured the session will reconnect to the same address after an
    /// unexpected disconnect.
    pub async fn dial(&self, addr: &str) -> Result<Session> {
        if *self.shared.state.lock().expect("state poisoned") != PeerState::Ok {
            return Err(Error::ConnectionClosed);
        }
        let network = self.shared.config.network;
        let dial = Stream::dial(network, addr);
        let stream = match self.shared.config.dial_timeout() {
            Some(t) => tokio::time::timeout(t, dial).await.map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", addr),
                ))
            })??,
            None => dial.await?,
        };

        let redial = if self.shared.config.redial_times > 0 {
            Some((addr.to_string(), self.shared.config.redial_times))
        } else {
            None
        };
        let (sess, reader) = self.new_session(stream, redial);

        if let Err(e) = self.shared.plugins().post_dial(&sess) {
            tracing::warn!(addr, error = %e, "post_dial plugin rejected connection");
            return Err(Error::Wire(e));
        }

        self.shared.insert_session(sess.clone());
        sess.start(reader);
        tracing::debug!(addr, id = %sess.id(), "dialed");
        Ok(sess)
    }

    /// Serve the configured listen address. Blocks until [`Peer::close`].
    pub async fn listen(&self) -> Result<()> {
        let addr = self.shared.config.listen_address.clone();
        if addr.is_empty() {
            return Err(Error::Config("listen_address is empty".into()));
        }
        let listener = Listener::bind(self.shared.config.network, &addr).await?;
        *self.shared.local_addr.lock().expect("local addr poisoned") =
            Some(listener.local_addr());
        tracing::info!(addr = %listener.local_addr(), "listening");

        loop {
            tokio::select! {
                _ = self.shared.shutdown.notified() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let (sess, reader) = self.new_session(stream, None);
                            if let Err(e) = self.shared.plugins().post_accept(&sess) {
                                tracing::warn!(remote = %remote, error = %e, "post_accept plugin rejected connection");
                                continue;
                            }
                            self.shared.insert_session(sess.clone());
                            sess.start(reader);
                            tracing::debug!(remote = %remote, id = %sess.id(), "accepted");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Bound listen address once [`Peer::listen`] is serving; useful when
    /// listening on port 0.
    pub fn local_addr(&self) -> Option<String> {
        self.shared
            .local_addr
            .lock()
            .expect("local addr poisoned")
            .clone()
    }

    /// Graceful global shutdown: stop accepting, close every session,
    /// bounded by a peer-wide grace.
    pub async fn close(&self) -> Result<()> {
        {
            let mut st = self.shared.state.lock().expect("state poisoned");
            if *st != PeerState::Ok {
                return Ok(());
            }
            *st = PeerState::Closing;
        }
        // notify_one stores a permit, so a listener that has not reached
        // its select yet still observes the shutdown.
        self.shared.shutdown.notify_one();

        let sessions: Vec<Session> = {
            let guard = self.shared.sessions.lock().expect("sessions poisoned");
            guard.values().cloned().collect()
        };
        let closes = sessions.iter().map(|s| s.close());
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(closes)).await;

        self.shared.sessions.lock().expect("sessions poisoned").clear();
        *self.shared.state.lock().expect("state poisoned") = PeerState::Closed;
        tracing::debug!("peer closed");
        Ok(())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().expect("sessions poisoned").len()
    }

    /// Look up a live session by id.
    pub fn session(&self, id: &str) -> Option<Session> {
        self.shared
            .sessions
            .lock()
            .expect("sessions poisoned")
            .get(id)
            .cloned()
    }

    fn new_session(
        &self,
        stream: Stream,
        redial: Option<(String, u32)>,
    ) -> (Session, crate::transport::ReadHalf) {
        let n = self.shared.session_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}#{}", stream.remote_addr(), n);
        Session::new(Arc::downgrade(&self.shared), id, stream, redial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;

    #[test]
    fn test_new_peer_validates_config() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        assert_eq!(peer.config().default_body_codec, "json");

        let bad = PeerConfig {
            default_body_codec: "yamlish".to_string(),
            ..Default::default()
        };
        assert!(matches!(Peer::new(bad), Err(Error::Config(_))));
    }

    #[test]
    fn test_route_registration_is_write_once() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        let make = || {
            PullGroup::new("/math").handler("Add", |_ctx, args: Vec<i64>| async move {
                Ok(args.iter().sum::<i64>())
            })
        };
        peer.route_pull(make()).unwrap();
        assert!(matches!(peer.route_pull(make()), Err(Error::Route(_))));
    }

    #[test]
    fn test_pull_and_push_registries_are_separate() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        peer.route_pull(
            PullGroup::new("/same").handler("Name", |_ctx, _: ()| async move { Ok(0i32) }),
        )
        .unwrap();
        // The same path in the PUSH registry is not a duplicate.
        peer.route_push(
            PushGroup::new("/same").handler("Name", |_ctx, _: ()| async move { Ok(()) }),
        )
        .unwrap();

        assert!(peer.shared.pull_router().get("/same/name").is_some());
        assert!(peer.shared.push_router().get("/same/name").is_some());
    }

    #[test]
    fn test_unknown_handlers_install_once() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        peer.set_unknown_pull(|_ctx| async move { Ok(0i32) }).unwrap();
        assert!(peer.set_unknown_pull(|_ctx| async move { Ok(0i32) }).is_err());

        peer.set_unknown_push(|_ctx| async move { Ok(()) }).unwrap();
        assert!(peer.set_unknown_push(|_ctx| async move { Ok(()) }).is_err());
    }

    #[test]
    fn test_set_default_proto() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        assert_eq!(peer.shared.header_codec(), BodyCodec::Json);
        peer.set_default_proto("msgpack").unwrap();
        assert_eq!(peer.shared.header_codec(), BodyCodec::MsgPack);
        assert!(peer.set_default_proto("bogus").is_err());
    }

    #[tokio::test]
    async fn test_listen_requires_address() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        assert!(matches!(peer.listen().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_dial_after_close_fails() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        peer.close().await.unwrap();
        assert!(matches!(
            peer.dial("127.0.0.1:1").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dial_unreachable_fails() {
        let peer = Peer::new(PeerConfig {
            network: Network::Tcp,
            default_dial_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();
        // TCP port 1 on localhost is essentially never listening.
        assert!(peer.dial("127.0.0.1:1").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let peer = Peer::new(PeerConfig::default()).unwrap();
        peer.close().await.unwrap();
        peer.close().await.unwrap();
    }
}
