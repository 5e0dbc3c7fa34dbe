//! Plugin hooks around the packet lifecycle.
//!
//! A [`Plugin`] observes (and may veto) every seam of a packet's journey:
//! connection establishment, header read, body read, reply write, and the
//! caller-side pull/reply seams. Hooks run synchronously on the session's
//! read task or dispatch task; implementations must not block.
//!
//! Returning a [`WireError`] short-circuits: on a PULL seam the error
//! becomes the immediate REPLY status with no body; on a PUSH seam the
//! packet is silently dropped; on a caller-side seam the pull completes
//! with the error.
//!
//! [`PluginContainer`] holds an ordered chain. The peer owns one chain;
//! route registration merges it with the group's chain into the effective
//! per-handler chain.

use std::sync::Arc;

use crate::context::PublicMap;
use crate::error::WireError;
use crate::protocol::Header;
use crate::session::Session;

/// Hook result: `Err` short-circuits with a wire-level error.
pub type HookResult = std::result::Result<(), WireError>;

/// Read-only view handed to packet-seam hooks.
pub struct HookCtx<'a> {
    pub(crate) session: &'a Session,
    pub(crate) header: &'a Header,
    pub(crate) public: &'a PublicMap,
}

impl HookCtx<'_> {
    /// The session carrying the packet.
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Header of the packet at this seam (input packet on read seams,
    /// output packet on write seams).
    pub fn header(&self) -> &Header {
        self.header
    }

    /// Packet URI.
    pub fn uri(&self) -> &str {
        &self.header.uri
    }

    /// Packet sequence number.
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// Public key/value map scoped to this packet's context.
    pub fn public(&self) -> &PublicMap {
        self.public
    }

    /// Remote address of the session.
    pub fn remote_addr(&self) -> String {
        self.session.remote_addr()
    }
}

/// An interceptor with a default no-op implementation for every hook.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync + 'static {
    /// A dialed connection has been established.
    fn post_dial(&self, session: &Session) -> HookResult {
        Ok(())
    }

    /// An accepted connection has been established.
    fn post_accept(&self, session: &Session) -> HookResult {
        Ok(())
    }

    /// A PULL header has been read.
    fn post_read_pull_header(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// PULL route resolved, body not yet decoded.
    fn pre_read_pull_body(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// PULL body decoded, handler not yet invoked.
    fn post_read_pull_body(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// A PUSH header has been read.
    fn post_read_push_header(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// PUSH route resolved, body not yet decoded.
    fn pre_read_push_body(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// PUSH body decoded, handler not yet invoked.
    fn post_read_push_body(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// Handler finished, REPLY not yet written.
    fn pre_write_reply(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// REPLY written.
    fn post_write_reply(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// Outbound PULL about to be written (caller side).
    fn pre_write_pull(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// Outbound PULL written (caller side).
    fn post_write_pull(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// A REPLY header has been read (caller side).
    fn post_read_reply_header(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// REPLY correlated, body not yet decoded (caller side).
    fn pre_read_reply_body(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }

    /// REPLY body decoded (caller side).
    fn post_read_reply_body(&self, ctx: &HookCtx<'_>) -> HookResult {
        Ok(())
    }
}

macro_rules! fan_out {
    ($name:ident, $arg:ty) => {
        /// Run the hook across the chain in order, stopping at the first error.
        pub fn $name(&self, arg: $arg) -> HookResult {
            for p in &self.plugins {
                p.$name(arg)?;
            }
            Ok(())
        }
    };
}

/// Ordered chain of plugins sharing the [`Plugin`] hook surface.
#[derive(Clone, Default)]
pub struct PluginContainer {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginContainer {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin to the chain.
    pub fn add(&mut self, plugin: impl Plugin) {
        self.plugins.push(Arc::new(plugin));
    }

    /// Append an already-shared plugin to the chain.
    pub fn add_arc(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// New chain running `self` first, then `other`.
    pub fn merge(&self, other: &PluginContainer) -> PluginContainer {
        let mut plugins = self.plugins.clone();
        plugins.extend(other.plugins.iter().cloned());
        PluginContainer { plugins }
    }

    /// Number of plugins in the chain.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fan_out!(post_dial, &Session);
    fan_out!(post_accept, &Session);
    fan_out!(post_read_pull_header, &HookCtx<'_>);
    fan_out!(pre_read_pull_body, &HookCtx<'_>);
    fan_out!(post_read_pull_body, &HookCtx<'_>);
    fan_out!(post_read_push_header, &HookCtx<'_>);
    fan_out!(pre_read_push_body, &HookCtx<'_>);
    fan_out!(post_read_push_body, &HookCtx<'_>);
    fan_out!(pre_write_reply, &HookCtx<'_>);
    fan_out!(post_write_reply, &HookCtx<'_>);
    fan_out!(pre_write_pull, &HookCtx<'_>);
    fan_out!(post_write_pull, &HookCtx<'_>);
    fan_out!(post_read_reply_header, &HookCtx<'_>);
    fan_out!(pre_read_reply_body, &HookCtx<'_>);
    fan_out!(post_read_reply_body, &HookCtx<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    impl Plugin for Counting {
        fn post_read_pull_header(&self, _ctx: &HookCtx<'_>) -> HookResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_at {
                return Err(WireError::new(Status::INTERNAL_SERVER_ERROR));
            }
            Ok(())
        }
    }

    fn hook_fixture() -> (Header, PublicMap) {
        let header = Header::new_pull(1, "/a", crate::codec::BodyCodec::Json, vec![]);
        (header, PublicMap::default())
    }

    #[test]
    fn test_chain_runs_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = PluginContainer::new();
        for _ in 0..3 {
            chain.add(Counting {
                calls: calls.clone(),
                fail_at: None,
            });
        }

        let session = crate::session::Session::detached_for_tests();
        let (header, public) = hook_fixture();
        let ctx = HookCtx {
            session: &session,
            header: &header,
            public: &public,
        };

        chain.post_read_pull_header(&ctx).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_chain_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = PluginContainer::new();
        for _ in 0..3 {
            chain.add(Counting {
                calls: calls.clone(),
                fail_at: Some(1),
            });
        }

        let session = crate::session::Session::detached_for_tests();
        let (header, public) = hook_fixture();
        let ctx = HookCtx {
            session: &session,
            header: &header,
            public: &public,
        };

        let err = chain.post_read_pull_header(&ctx).unwrap_err();
        assert!(err.is(Status::INTERNAL_SERVER_ERROR));
        // First call succeeded, second failed, third never ran.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_merge_order() {
        struct Noop;
        impl Plugin for Noop {}

        let mut a = PluginContainer::new();
        a.add(Noop);
        let mut b = PluginContainer::new();
        b.add(Noop);
        b.add(Noop);

        let merged = a.merge(&b);
        assert_eq!(merged.len(), 3);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
    }
}
