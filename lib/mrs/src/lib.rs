//! MRS Protocol Library
//!
//! Shared types and logic for the Mixed Reality Service: a federated
//! spatial registry that binds bounded geographic volumes ("spaces") to
//! service URIs and answers "what services exist here?" queries.
//!
//! This crate holds everything the server and clients agree on: the wire
//! model, the WGS-84 geometry kernel, input validation, the error
//! taxonomy, and the referral-following search client.

pub mod client;
pub mod error;
pub mod geo;
pub mod types;
pub mod validation;

pub use client::MrsClient;
pub use error::MrsError;
pub use types::{
    BoundingBox, ChangeEvent, ChangeKind, ErrorCode, ErrorResponse, Geometry, KeyAlgorithm,
    Location, PublishedKey, Referral, Registration, SearchResult, Tombstone,
};
