//! Shared foundational types for the Strata semantic store.
//!
//! This crate provides the types every other Strata crate builds on: content
//! hashing for staleness checks, interned identifiers, source spans, the
//! persistent unit index, and common result types.

#![warn(missing_docs)]

pub mod hash;
pub mod ident;
pub mod index;
pub mod result;
pub mod span;

pub use hash::ContentHash;
pub use ident::{Ident, Interner};
pub use index::{ItemRef, UnitIndex};
pub use result::{InternalError, StrataResult};
pub use span::Span;
