//! The semantic unit: per-file analysis results and their on-disk form.
//!
//! A unit owns three ordered collections of items (scopes, declarations,
//! and diagnostics) plus an import list. This crate implements the item
//! model, the runtime kind registry that turns stored type tags back into
//! typed items, and the lazy (de)serialization engine: header-only loads,
//! pageable offset tables, on-demand item materialization out of an
//! append-only byte arena, and the no-op-when-clean store path.

#![warn(missing_docs)]

pub mod dynamic;
pub mod error;
pub mod item;
pub mod storage;
pub mod unit;

pub use dynamic::{load_imports, load_path};
pub use error::UnitError;
pub use item::{
    DeclKind, DeclarationData, DecodeFn, DiagnosticData, ItemPayload, KindRegistry, ScopeData,
    ScopeKind, Severity, TAG_DECLARATION, TAG_DIAGNOSTIC, TAG_FIRST_CUSTOM, TAG_SCOPE,
};
pub use storage::{is_temporary_index, Item, ItemOffset};
pub use unit::{features, Unit, UnitContext, UnitHeader, FORMAT_VERSION};
