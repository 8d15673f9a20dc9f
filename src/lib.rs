//! # Wisp Backend
//!
//! Server core of a zero-knowledge, ephemeral messaging service. Clients
//! hold all encryption keys; the server stores only ciphertext blobs,
//! routing metadata, and delivery state.
//!
//! ## Design Principles
//!
//! - **No plaintext content**: everything stored is client-side ciphertext
//! - **Time-limited rooms**: two-party conversations with a one-shot share link
//! - **At-least-once delivery**: server-assigned ids make redelivery safe
//! - **Minimal logging**: no ciphertext or full identifiers ever logged
//!
//! ## Architecture
//!
//! ```text
//!  client ──POST /messages/buffered──▶ queue ──worker──▶ store
//!     ▲                                              │
//!     │         ┌──── user queue (delivery ACK) ─────┤
//!  /ws hub ◀────┤                                    │
//!               └──── topic (new message) ───────────┘
//!                             APNS ◀── offline devices
//! ```
//!
//! The sweeper expires conversations, purges consumed and expired
//! messages, and reclaims file storage on a fixed cadence.

pub mod apns;
pub mod cache;
pub mod config;
pub mod conversations;
pub mod devices;
pub mod error;
pub mod files;
pub mod handlers;
pub mod hub;
pub mod messages;
pub mod models;
pub mod queue;
pub mod store;
pub mod sweeper;
pub mod tier;
pub mod worker;

pub use config::Config;
pub use error::ApiError;
pub use handlers::{build_router, AppState};
pub use store::Store;
