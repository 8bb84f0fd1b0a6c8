//! `troupe-store` — relational data model for spaces, participants, and
//! conversation timelines.
//!
//! Everything persists to a single SQLite database. Stores share one
//! [`db::Db`] handle so multi-table operations (and the scheduler's
//! commit-plus-finalize transactions in `troupe-engine`) stay atomic.
//!
//! Run and round tables live in `troupe-runs`, initialised against the same
//! connection.

pub mod content;
pub mod conversations;
pub mod db;
pub mod error;
pub mod messages;
mod rows;
pub mod spaces;
pub mod types;

pub use conversations::ConversationStore;
pub use db::{init_db, shared, Db};
pub use error::{Result, StoreError};
pub use messages::MessageStore;
pub use spaces::{NewMembership, NewSpace, SpaceStore};
pub use types::{
    Conversation, ConversationKind, CopilotMode, InputPolicy, MemberStatus, MembershipKind,
    Message, MessageSwipe, Participation, ReplyOrder, Role, SchedulingState, Space,
    SpaceMembership, Visibility,
};
