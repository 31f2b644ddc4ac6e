//! MRS Server - Federated Spatial Registry Node
//!
//! Binds bounded geographic volumes to service URIs and answers
//! "what services exist here?" queries, federating with peer servers
//! through referrals and canonical-record sync.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod auth;
pub mod auth_handlers;
pub mod config;
pub mod federation;
pub mod handlers;
pub mod identity_store;
pub mod ids;
pub mod peer_handlers;
pub mod peer_store;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod store;
pub mod sync_handlers;
pub mod wellknown;

pub use config::Settings;
pub use server::{create_router, init_state, run};
pub use store::SqliteStore;
