//! Transfer filters - byte-level codecs applied to packet bodies.
//!
//! A filter transforms body bytes on the way out ([`TransferFilter::pack`])
//! and inverts the transformation on the way in
//! ([`TransferFilter::unpack`]). Filters compose as a stack declared in the
//! packet header: outbound applies them in declared order, inbound unwinds
//! in reverse.
//!
//! The registry is process-wide. The gzip filter (id `b'g'`) is installed
//! when the registry is first touched; additional filters must be
//! registered via [`reg`] at process start, before any peer is constructed.
//! Registering a duplicate id panics - a misconfigured filter table is a
//! programming error, not a runtime condition.

mod gzip;

pub use gzip::Gzip;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::{Status, WireError};

/// A byte-level transfer filter, identified by a one-byte id.
pub trait TransferFilter: Send + Sync + 'static {
    /// One-byte id carried in packet headers.
    fn id(&self) -> u8;

    /// Filter body bytes on packing (outbound).
    fn pack(&self, src: &[u8]) -> std::io::Result<Vec<u8>>;

    /// Invert the filter on unpacking (inbound).
    fn unpack(&self, src: &[u8]) -> std::io::Result<Vec<u8>>;
}

static REGISTRY: LazyLock<RwLock<HashMap<u8, Arc<dyn TransferFilter>>>> = LazyLock::new(|| {
    let mut map: HashMap<u8, Arc<dyn TransferFilter>> = HashMap::new();
    let gzip = Gzip::new(5);
    map.insert(gzip.id(), Arc::new(gzip));
    RwLock::new(map)
});

/// Register a transfer filter process-wide.
///
/// # Panics
///
/// Panics if a filter with the same id is already registered.
pub fn reg(filter: impl TransferFilter) {
    let id = filter.id();
    let mut map = REGISTRY.write().expect("xfer registry poisoned");
    if map.contains_key(&id) {
        panic!("xfer: transfer filter id {:?} already registered", id as char);
    }
    map.insert(id, Arc::new(filter));
}

/// Look up a registered filter by id.
pub fn get(id: u8) -> Option<Arc<dyn TransferFilter>> {
    REGISTRY.read().expect("xfer registry poisoned").get(&id).cloned()
}

/// Apply a filter stack to outbound body bytes, in declared order.
pub fn pack(ids: &[u8], body: Vec<u8>) -> Result<Vec<u8>, WireError> {
    let mut out = body;
    for &id in ids {
        let filter = get(id).ok_or_else(|| {
            WireError::with_cause(Status::BAD_PACKET, format!("unknown transfer filter id {}", id))
        })?;
        out = filter
            .pack(&out)
            .map_err(|e| WireError::with_cause(Status::BAD_PACKET, e))?;
    }
    Ok(out)
}

/// Unwind a filter stack on inbound body bytes, in reverse declared order.
pub fn unpack(ids: &[u8], body: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = body.to_vec();
    for &id in ids.iter().rev() {
        let filter = get(id).ok_or_else(|| {
            WireError::with_cause(Status::BAD_PACKET, format!("unknown transfer filter id {}", id))
        })?;
        out = filter
            .unpack(&out)
            .map_err(|e| WireError::with_cause(Status::BAD_PACKET, e))?;
    }
    Ok(out)
}
