//! `troupe-events` — per-conversation realtime fan-out.
//!
//! Two logical topics per conversation with distinct schemas: an ephemeral
//! JSON topic for tokens/typing (tolerant to reorder via `render_seq`) and a
//! persistent topic for committed timeline mutations. Failed workers can
//! never leave partial state here — the persistent topic only ever carries
//! rows that exist.

pub mod publisher;
pub mod types;

pub use publisher::Publisher;
pub use types::{
    EphemeralEnvelope, EphemeralEvent, PersistentEnvelope, PersistentEvent,
};
