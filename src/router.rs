//! Path-indexed handler registries and route registration.
//!
//! A peer owns two routers, one for PULL paths and one for PUSH paths.
//! Routes are registered through group trees ([`PullGroup`] /
//! [`PushGroup`]): a group has a path prefix, leaf handlers, and child
//! groups; a leaf's path is `{group_prefix}/{handler_name}` with the name
//! snake_cased. Registration is write-once - re-registering a path fails.
//!
//! Typed handlers are erased at registration time into a boxed thunk that
//! owns decode → invoke → encode; dispatch never reflects on types. Each
//! registry may additionally carry one catch-all "unknown" handler that
//! receives raw body bytes when no exact path matches.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::BodyCodec;
use crate::context::{PullCtx, PushCtx, UnknownCtx};
use crate::error::{Error, Result, Status, WireError};
use crate::plugin::PluginContainer;

/// Boxed future produced by handler thunks.
pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What a PULL thunk produces: an encoded reply body and the codec that
/// encoded it, or a wire error.
pub(crate) struct PullOutcome {
    pub body: Vec<u8>,
    pub codec: BodyCodec,
    pub err: Option<WireError>,
}

impl PullOutcome {
    pub fn ok(body: Vec<u8>, codec: BodyCodec) -> Self {
        Self {
            body,
            codec,
            err: None,
        }
    }

    pub fn err(err: WireError) -> Self {
        Self {
            body: Vec::new(),
            codec: BodyCodec::Json,
            err: Some(err),
        }
    }
}

pub(crate) type PullThunk = Box<dyn Fn(PullCtx, Bytes) -> BoxFuture<PullOutcome> + Send + Sync>;
pub(crate) type PushThunk =
    Box<dyn Fn(PushCtx, Bytes) -> BoxFuture<Option<WireError>> + Send + Sync>;
pub(crate) type UnknownPullThunk = Box<dyn Fn(UnknownCtx) -> BoxFuture<PullOutcome> + Send + Sync>;
pub(crate) type UnknownPushThunk =
    Box<dyn Fn(UnknownCtx) -> BoxFuture<Option<WireError>> + Send + Sync>;

/// The invocation half of a handler descriptor.
pub(crate) enum Thunk {
    Pull(PullThunk),
    Push(PushThunk),
    UnknownPull(UnknownPullThunk),
    UnknownPush(UnknownPushThunk),
}

/// A registered handler: path, catch-all marker, effective plugin chain,
/// and the boxed invocation thunk.
pub(crate) struct Handler {
    pub path: String,
    pub is_unknown: bool,
    pub plugins: Arc<PluginContainer>,
    pub thunk: Thunk,
}

/// Normalize a path for registration and lookup: lowercased, leading
/// slash ensured, trailing slash trimmed.
pub(crate) fn normalize_path(p: &str) -> String {
    let mut s = p.trim().to_lowercase();
    if !s.starts_with('/') {
        s.insert(0, '/');
    }
    while s.len() > 1 && s.ends_with('/') {
        s.pop();
    }
    s
}

/// Convert a handler name to snake_case: `GetStatus` → `get_status`.
pub(crate) fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// Path-indexed handler registry for one packet kind.
#[derive(Default)]
pub(crate) struct Router {
    handlers: HashMap<String, Arc<Handler>>,
    unknown: Option<Arc<Handler>>,
}

impl Router {
    /// Exact path match; falls back to the unknown handler when installed.
    pub fn get(&self, path: &str) -> Option<Arc<Handler>> {
        if let Some(h) = self.handlers.get(path) {
            return Some(h.clone());
        }
        self.unknown.clone()
    }

    /// Register a handler; a duplicate path fails.
    pub fn register(&mut self, handler: Handler) -> Result<()> {
        let path = handler.path.clone();
        if self.handlers.contains_key(&path) {
            return Err(Error::Route(format!("path {:?} already registered", path)));
        }
        self.handlers.insert(path, Arc::new(handler));
        Ok(())
    }

    /// Install the catch-all handler; a second install fails.
    pub fn set_unknown(&mut self, handler: Handler) -> Result<()> {
        if self.unknown.is_some() {
            return Err(Error::Route("unknown handler already registered".into()));
        }
        self.unknown = Some(Arc::new(handler));
        Ok(())
    }

    /// Register every leaf of a PULL group tree under the base plugin chain.
    pub fn register_pull_group(&mut self, group: PullGroup, base: &PluginContainer) -> Result<()> {
        let prefix = normalize_path(&group.prefix);
        let chain = base.merge(&group.plugins);
        for (name, thunk) in group.leaves {
            let path = normalize_path(&format!("{}/{}", prefix, snake_case(&name)));
            self.register(Handler {
                path,
                is_unknown: false,
                plugins: Arc::new(chain.clone()),
                thunk: Thunk::Pull(thunk),
            })?;
        }
        for mut child in group.children {
            child.prefix = format!("{}/{}", prefix, child.prefix.trim_start_matches('/'));
            child.plugins = chain.merge(&child.plugins);
            self.register_pull_group(child, &PluginContainer::new())?;
        }
        Ok(())
    }

    /// Register every leaf of a PUSH group tree under the base plugin chain.
    pub fn register_push_group(&mut self, group: PushGroup, base: &PluginContainer) -> Result<()> {
        let prefix = normalize_path(&group.prefix);
        let chain = base.merge(&group.plugins);
        for (name, thunk) in group.leaves {
            let path = normalize_path(&format!("{}/{}", prefix, snake_case(&name)));
            self.register(Handler {
                path,
                is_unknown: false,
                plugins: Arc::new(chain.clone()),
                thunk: Thunk::Push(thunk),
            })?;
        }
        for mut child in group.children {
            child.prefix = format!("{}/{}", prefix, child.prefix.trim_start_matches('/'));
            child.plugins = chain.merge(&child.plugins);
            self.register_push_group(child, &PluginContainer::new())?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Erase a typed PULL handler into a thunk.
fn pull_thunk<A, R, F, Fut>(f: F) -> PullThunk
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(PullCtx, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, WireError>> + Send + 'static,
{
    let f = Arc::new(f);
    Box::new(move |ctx: PullCtx, body: Bytes| {
        let f = f.clone();
        Box::pin(async move {
            let arg: A = match ctx.shared.input_codec.decode(&body) {
                Ok(v) => v,
                Err(e) => return PullOutcome::err(WireError::with_cause(Status::BAD_PACKET, e)),
            };
            match f(ctx.clone(), arg).await {
                Ok(reply) => {
                    let codec = ctx.shared.reply_codec_or_input();
                    match codec.encode(&reply) {
                        Ok(bytes) => PullOutcome::ok(bytes, codec),
                        Err(e) => PullOutcome::err(WireError::with_cause(
                            Status::INTERNAL_SERVER_ERROR,
                            e,
                        )),
                    }
                }
                Err(err) => PullOutcome::err(err),
            }
        })
    })
}

/// Erase a typed PUSH handler into a thunk.
fn push_thunk<A, F, Fut>(f: F) -> PushThunk
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), WireError>> + Send + 'static,
{
    let f = Arc::new(f);
    Box::new(move |ctx: PushCtx, body: Bytes| {
        let f = f.clone();
        Box::pin(async move {
            let arg: A = match ctx.shared.input_codec.decode(&body) {
                Ok(v) => v,
                Err(e) => return Some(WireError::with_cause(Status::BAD_PACKET, e)),
            };
            f(ctx, arg).await.err()
        })
    })
}

/// Build the catch-all PULL handler descriptor.
pub(crate) fn unknown_pull_handler<R, F, Fut>(f: F, plugins: Arc<PluginContainer>) -> Handler
where
    R: Serialize + Send + 'static,
    F: Fn(UnknownCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, WireError>> + Send + 'static,
{
    let f = Arc::new(f);
    let thunk: UnknownPullThunk = Box::new(move |ctx: UnknownCtx| {
        let f = f.clone();
        Box::pin(async move {
            match f(ctx.clone()).await {
                Ok(reply) => {
                    let codec = ctx.shared.reply_codec_or_input();
                    match codec.encode(&reply) {
                        Ok(bytes) => PullOutcome::ok(bytes, codec),
                        Err(e) => PullOutcome::err(WireError::with_cause(
                            Status::INTERNAL_SERVER_ERROR,
                            e,
                        )),
                    }
                }
                Err(err) => PullOutcome::err(err),
            }
        })
    });
    Handler {
        path: String::new(),
        is_unknown: true,
        plugins,
        thunk: Thunk::UnknownPull(thunk),
    }
}

/// Build the catch-all PUSH handler descriptor.
pub(crate) fn unknown_push_handler<F, Fut>(f: F, plugins: Arc<PluginContainer>) -> Handler
where
    F: Fn(UnknownCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), WireError>> + Send + 'static,
{
    let f = Arc::new(f);
    let thunk: UnknownPushThunk = Box::new(move |ctx: UnknownCtx| {
        let f = f.clone();
        Box::pin(async move { f(ctx).await.err() })
    });
    Handler {
        path: String::new(),
        is_unknown: true,
        plugins,
        thunk: Thunk::UnknownPush(thunk),
    }
}

/// A tree of PULL handlers sharing a path prefix and a plugin chain.
///
/// # Example
///
/// ```ignore
/// let group = PullGroup::new("/math")
///     .handler("Add", |_ctx, args: Vec<i64>| async move {
///         Ok(args.iter().sum::<i64>())
///     });
/// peer.route_pull(group)?;
/// // registered at /math/add
/// ```
pub struct PullGroup {
    pub(crate) prefix: String,
    pub(crate) plugins: PluginContainer,
    pub(crate) leaves: Vec<(String, PullThunk)>,
    pub(crate) children: Vec<PullGroup>,
}

impl PullGroup {
    /// Create a group rooted at the given path prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            plugins: PluginContainer::new(),
            leaves: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Append a plugin to this group's chain (applies to all leaves below).
    pub fn plugin(mut self, plugin: impl crate::plugin::Plugin) -> Self {
        self.plugins.add(plugin);
        self
    }

    /// Register a typed PULL handler leaf. The leaf path is
    /// `{prefix}/{snake_case(name)}`.
    pub fn handler<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(PullCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, WireError>> + Send + 'static,
    {
        self.leaves.push((name.to_string(), pull_thunk(f)));
        self
    }

    /// Nest a child group under this prefix.
    pub fn group(mut self, child: PullGroup) -> Self {
        self.children.push(child);
        self
    }
}

/// A tree of PUSH handlers sharing a path prefix and a plugin chain.
pub struct PushGroup {
    pub(crate) prefix: String,
    pub(crate) plugins: PluginContainer,
    pub(crate) leaves: Vec<(String, PushThunk)>,
    pub(crate) children: Vec<PushGroup>,
}

impl PushGroup {
    /// Create a group rooted at the given path prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            plugins: PluginContainer::new(),
            leaves: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Append a plugin to this group's chain (applies to all leaves below).
    pub fn plugin(mut self, plugin: impl crate::plugin::Plugin) -> Self {
        self.plugins.add(plugin);
        self
    }

    /// Register a typed PUSH handler leaf. The leaf path is
    /// `{prefix}/{snake_case(name)}`.
    pub fn handler<A, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WireError>> + Send + 'static,
    {
        self.leaves.push((name.to_string(), push_thunk(f)));
        self
    }

    /// Nest a child group under this prefix.
    pub fn group(mut self, child: PushGroup) -> Self {
        self.children.push(child);
        self
    }
}
