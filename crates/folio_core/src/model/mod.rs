//! Core domain model for folio.
//!
//! # Responsibility
//! - Define document entities, source helpers, permissions and the type
//!   registry.
//! - Keep the model independent from storage and collection concerns.

pub mod client;
pub mod document;
pub mod error;
pub mod permission;
pub mod registry;
pub mod source;
