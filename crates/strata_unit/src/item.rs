//! Item payloads and the runtime kind registry.
//!
//! Every item is persisted as `[type tag][payload bytes]`. The tag is
//! resolved at materialization time through a registered-constructor table,
//! so serialization stays a closed, auditable operation: an unknown tag
//! (say, a record written by a language plugin that is not loaded) fails
//! closed instead of crashing.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_common::Span;

/// Type tag of scope payloads.
pub const TAG_SCOPE: u16 = 1;
/// Type tag of plain declaration payloads.
pub const TAG_DECLARATION: u16 = 2;
/// Type tag of diagnostic payloads.
pub const TAG_DIAGNOSTIC: u16 = 3;

/// First tag value available to language-specific declaration subtypes.
pub const TAG_FIRST_CUSTOM: u16 = 0x100;

/// What kind of region a scope covers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ScopeKind {
    /// The file-level scope of the unit.
    File,
    /// A namespace or module scope.
    Namespace,
    /// The body of a type definition.
    Type,
    /// A function body.
    Function,
    /// An anonymous nested block.
    Block,
}

/// Payload of a scope item.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ScopeData {
    /// What kind of region this scope covers.
    pub kind: ScopeKind,
    /// The scope's name, if it has one (namespaces, functions, types).
    pub name: Option<String>,
    /// Byte range of the scope in the source file.
    pub span: Span,
}

/// What a declaration declares.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum DeclKind {
    /// A variable or constant binding.
    Variable,
    /// A function or method.
    Function,
    /// A type (class, struct, enum, alias).
    Type,
    /// A module or namespace declaration.
    Module,
    /// An import/include that pulls in another unit.
    Import,
}

/// Payload of a declaration item.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct DeclarationData {
    /// The declared name.
    pub name: String,
    /// What the declaration declares.
    pub kind: DeclKind,
    /// Byte range of the declaration in the source file.
    pub span: Span,
    /// `true` if this is a definition rather than a forward declaration.
    pub is_definition: bool,
}

/// The severity level of a diagnostic.
///
/// Ordered from least severe (`Hint`) to most severe (`Error`), matching the
/// derived `PartialOrd`/`Ord` implementation based on declaration order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum Severity {
    /// A suggestion that doesn't indicate a problem.
    Hint,
    /// A potential issue worth reviewing.
    Warning,
    /// A definite problem in the source.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Hint => write!(f, "hint"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Payload of a diagnostic item. Diagnostics always live in the file-level
/// scope; their parent index is 0.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct DiagnosticData {
    /// How severe the finding is.
    pub severity: Severity,
    /// The human-readable message.
    pub message: String,
    /// Byte range the diagnostic points at.
    pub span: Span,
}

/// A decoded item payload of any kind.
#[derive(Clone, PartialEq, Debug)]
pub enum ItemPayload {
    /// A scope payload.
    Scope(ScopeData),
    /// A declaration payload.
    Declaration(DeclarationData),
    /// A diagnostic payload.
    Diagnostic(DiagnosticData),
}

/// A registered payload constructor: raw bytes to a typed payload.
pub type DecodeFn = fn(&[u8]) -> Option<ItemPayload>;

fn decode_scope(bytes: &[u8]) -> Option<ItemPayload> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .ok()
        .map(|(data, _)| ItemPayload::Scope(data))
}

fn decode_declaration(bytes: &[u8]) -> Option<ItemPayload> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .ok()
        .map(|(data, _)| ItemPayload::Declaration(data))
}

fn decode_diagnostic(bytes: &[u8]) -> Option<ItemPayload> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .ok()
        .map(|(data, _)| ItemPayload::Diagnostic(data))
}

/// The runtime table mapping stored type tags to payload constructors.
///
/// Pre-seeded with the built-in kinds; language integrations may register
/// additional declaration subtypes (tags at or above
/// [`TAG_FIRST_CUSTOM`]) before the session starts loading units.
pub struct KindRegistry {
    factories: HashMap<u16, DecodeFn>,
}

impl KindRegistry {
    /// Creates a registry seeded with the built-in item kinds.
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(TAG_SCOPE, decode_scope);
        registry.register(TAG_DECLARATION, decode_declaration);
        registry.register(TAG_DIAGNOSTIC, decode_diagnostic);
        registry
    }

    /// Registers a constructor for a type tag.
    ///
    /// Registering a tag twice indicates a bug in session setup: it asserts
    /// in debug builds; in release builds the new constructor wins.
    pub fn register(&mut self, tag: u16, decode: DecodeFn) {
        let previous = self.factories.insert(tag, decode);
        if previous.is_some() {
            debug_assert!(false, "item kind tag {tag} registered twice");
            log::error!("item kind tag {tag} registered twice, keeping the new constructor");
        }
    }

    /// Decodes a stored payload through the registered constructor.
    ///
    /// Unknown tags and undecodable payloads fail closed: the error is
    /// logged and `None` is returned, so a stale or foreign record degrades
    /// to a missing item instead of crashing.
    pub fn decode(&self, tag: u16, bytes: &[u8]) -> Option<ItemPayload> {
        match self.factories.get(&tag) {
            Some(decode) => {
                let payload = decode(bytes);
                if payload.is_none() {
                    log::error!("failed to decode item payload with tag {tag}");
                }
                payload
            }
            None => {
                log::error!("no item kind registered for tag {tag}");
                None
            }
        }
    }

    /// Returns `true` if a constructor is registered for `tag`.
    pub fn knows(&self, tag: u16) -> bool {
        self.factories.contains_key(&tag)
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::with_builtin_kinds()
    }
}

impl ItemPayload {
    /// The type tag this payload is stored under.
    pub fn type_tag(&self) -> u16 {
        match self {
            ItemPayload::Scope(_) => TAG_SCOPE,
            ItemPayload::Declaration(_) => TAG_DECLARATION,
            ItemPayload::Diagnostic(_) => TAG_DIAGNOSTIC,
        }
    }
}

/// Payload types that can live in an item storage.
pub(crate) trait StoredKind: Clone {
    /// Kind name used in log messages.
    const KIND_NAME: &'static str;

    /// The type tag this payload serializes under.
    fn type_tag(&self) -> u16;

    /// Serializes the payload body (without the tag).
    fn encode(&self) -> Result<Vec<u8>, String>;

    /// Projects a decoded payload back into this kind.
    fn from_payload(payload: ItemPayload) -> Option<Self>;
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| e.to_string())
}

impl StoredKind for ScopeData {
    const KIND_NAME: &'static str = "scope";

    fn type_tag(&self) -> u16 {
        TAG_SCOPE
    }

    fn encode(&self) -> Result<Vec<u8>, String> {
        encode_body(self)
    }

    fn from_payload(payload: ItemPayload) -> Option<Self> {
        match payload {
            ItemPayload::Scope(data) => Some(data),
            _ => None,
        }
    }
}

impl StoredKind for DeclarationData {
    const KIND_NAME: &'static str = "declaration";

    fn type_tag(&self) -> u16 {
        TAG_DECLARATION
    }

    fn encode(&self) -> Result<Vec<u8>, String> {
        encode_body(self)
    }

    fn from_payload(payload: ItemPayload) -> Option<Self> {
        match payload {
            ItemPayload::Declaration(data) => Some(data),
            _ => None,
        }
    }
}

impl StoredKind for DiagnosticData {
    const KIND_NAME: &'static str = "diagnostic";

    fn type_tag(&self) -> u16 {
        TAG_DIAGNOSTIC
    }

    fn encode(&self) -> Result<Vec<u8>, String> {
        encode_body(self)
    }

    fn from_payload(payload: ItemPayload) -> Option<Self> {
        match payload {
            ItemPayload::Diagnostic(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tags_are_registered() {
        let registry = KindRegistry::with_builtin_kinds();
        assert!(registry.knows(TAG_SCOPE));
        assert!(registry.knows(TAG_DECLARATION));
        assert!(registry.knows(TAG_DIAGNOSTIC));
        assert!(!registry.knows(TAG_FIRST_CUSTOM));
    }

    #[test]
    fn scope_roundtrip_through_registry() {
        let registry = KindRegistry::with_builtin_kinds();
        let data = ScopeData {
            kind: ScopeKind::Function,
            name: Some("main".to_string()),
            span: Span::new(10, 80),
        };
        let bytes = data.encode().unwrap();
        let decoded = registry.decode(TAG_SCOPE, &bytes).unwrap();
        assert_eq!(decoded, ItemPayload::Scope(data));
    }

    #[test]
    fn declaration_roundtrip_through_registry() {
        let registry = KindRegistry::with_builtin_kinds();
        let data = DeclarationData {
            name: "parse_expr".to_string(),
            kind: DeclKind::Function,
            span: Span::new(0, 5),
            is_definition: true,
        };
        let bytes = data.encode().unwrap();
        let decoded = registry.decode(TAG_DECLARATION, &bytes).unwrap();
        assert_eq!(decoded, ItemPayload::Declaration(data));
    }

    #[test]
    fn unknown_tag_fails_closed() {
        let registry = KindRegistry::with_builtin_kinds();
        assert!(registry.decode(999, b"whatever").is_none());
    }

    #[test]
    fn garbage_payload_fails_closed() {
        let registry = KindRegistry::with_builtin_kinds();
        assert!(registry.decode(TAG_SCOPE, b"\xff\xff\xff\xff\xff").is_none());
    }

    #[test]
    fn custom_kind_registration() {
        fn decode_custom(bytes: &[u8]) -> Option<ItemPayload> {
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .ok()
                .map(|(data, _)| ItemPayload::Declaration(data))
        }

        let mut registry = KindRegistry::with_builtin_kinds();
        registry.register(TAG_FIRST_CUSTOM, decode_custom);

        let data = DeclarationData {
            name: "template_instance".to_string(),
            kind: DeclKind::Type,
            span: Span::DUMMY,
            is_definition: false,
        };
        let bytes = data.encode().unwrap();
        assert!(registry.decode(TAG_FIRST_CUSTOM, &bytes).is_some());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Hint < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert_eq!(format!("{}", Severity::Error), "error");
    }
}
