//! # peerwire
//!
//! A symmetric peer-to-peer RPC runtime. Every peer may simultaneously act
//! as a server (accepting inbound connections on a listen address) and a
//! client (dialing outbound connections). Over each connection two peers
//! exchange three packet kinds:
//!
//! - **PULL** - a request expecting a correlated REPLY
//! - **PUSH** - a fire-and-forget notification
//! - **REPLY** - the answer to a PULL, correlated by sequence number
//!
//! Handlers are registered by URI path; bodies go through a named codec
//! (json, msgpack) and an optional stack of byte-level transfer filters
//! (gzip); plugins hook every seam of the packet lifecycle.
//!
//! ## Server
//!
//! ```ignore
//! use peerwire::{Peer, PeerConfig, PullGroup};
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let peer = Peer::new(PeerConfig {
//!         listen_address: "127.0.0.1:9090".to_string(),
//!         ..Default::default()
//!     })?;
//!     peer.route_pull(
//!         PullGroup::new("/math").handler("Add", |_ctx, args: Vec<i64>| async move {
//!             Ok(args.iter().sum::<i64>())
//!         }),
//!     )?;
//!     peer.listen().await
//! }
//! ```
//!
//! ## Client
//!
//! ```ignore
//! let peer = Peer::new(PeerConfig::default())?;
//! let session = peer.dial("127.0.0.1:9090").await?;
//! let reply: i64 = session
//!     .pull("/math/add", &vec![1, 2, 3, 4, 5])
//!     .await?
//!     .result()
//!     .await?;
//! assert_eq!(reply, 15);
//! ```
//!
//! ## Initialization order
//!
//! Process-wide state - the transfer-filter registry
//! ([`xfer::reg`]) and the packet size limit
//! ([`protocol::set_read_limit`]) - must be configured before the first
//! peer is constructed. The gzip filter registers itself on first use of
//! the registry; body codecs are compiled in.

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod peer;
pub mod plugin;
pub mod protocol;
pub mod router;
pub mod session;
pub mod xfer;

mod transport;

pub use config::{Network, PeerConfig};
pub use context::{PublicMap, PullCtx, PushCtx, UnknownCtx};
pub use error::{Error, Result, Status, WireError};
pub use peer::Peer;
pub use plugin::{HookCtx, Plugin, PluginContainer};
pub use router::{PullGroup, PushGroup};
pub use session::{CallOpts, PullCmd, Session, SessionState};
