//! Chunking codec for oversized payloads.
//!
//! The data channel has a safe per-message limit well below what a large
//! request body can produce, so any payload bigger than [`FRAGMENT_SIZE`]
//! is split into ordered, correlation-tagged fragments and reassembled on
//! the receiving side. Per-response body streaming has its own framing and
//! does not go through this codec.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::Result;

/// Safe fragment payload bound for a single data-channel message (16 KiB).
pub const FRAGMENT_SIZE: usize = 16 * 1024;

/// One fragment of a split payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "chunk")]
pub struct Fragment {
    pub id: String,
    pub idx: u32,
    pub total: u32,
    pub data: String,
}

/// Split `payload` into fragments tagged with `id`.
///
/// An empty payload still yields one (empty) fragment so the receiving side
/// always sees a complete message.
pub fn split(payload: &[u8], id: &str) -> Vec<Fragment> {
    let total = payload.len().div_ceil(FRAGMENT_SIZE).max(1) as u32;
    let mut fragments = Vec::with_capacity(total as usize);

    for idx in 0..total {
        let start = idx as usize * FRAGMENT_SIZE;
        let end = (start + FRAGMENT_SIZE).min(payload.len());
        fragments.push(Fragment {
            id: id.to_string(),
            idx,
            total,
            data: BASE64.encode(&payload[start..end]),
        });
    }
    fragments
}

struct Partial {
    total: u32,
    received: u32,
    parts: Vec<Option<Vec<u8>>>,
}

/// Buffers fragments per correlation id until a payload is complete.
#[derive(Default)]
pub struct Reassembler {
    partials: HashMap<String, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the reassembled payload once all `total`
    /// fragments for its id have arrived, `None` while still partial.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        let data = BASE64.decode(&fragment.data)?;

        let partial = self
            .partials
            .entry(fragment.id.clone())
            .or_insert_with(|| Partial {
                total: fragment.total,
                received: 0,
                parts: vec![None; fragment.total as usize],
            });

        if fragment.total != partial.total || fragment.idx >= partial.total {
            warn!(
                id = %fragment.id,
                idx = fragment.idx,
                total = fragment.total,
                "Dropping inconsistent fragment"
            );
            return Ok(None);
        }

        let slot = &mut partial.parts[fragment.idx as usize];
        if slot.is_none() {
            *slot = Some(data);
            partial.received += 1;
        }

        if partial.received < partial.total {
            return Ok(None);
        }

        let partial = self.partials.remove(&fragment.id).expect("entry exists");
        let mut whole = Vec::new();
        for part in partial.parts {
            whole.extend_from_slice(&part.expect("all fragments received"));
        }
        Ok(Some(whole))
    }

    /// Number of payloads still awaiting fragments.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
