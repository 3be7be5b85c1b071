#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-identity** – Deterministic entity/relationship identifiers (C2).
//!
//! Two independent pipeline runs indexing the same file content at the
//! same path MUST produce the same `entity_id`; this is the sole mechanism
//! by which the graph store adapter (C4) achieves upsert idempotence
//! without a central registry. All ids are BLAKE3-derived and every
//! constructor funnels through [`validate_entity_id`] so a malformed id
//! can never reach a store adapter.

use kg_types::EntityType;

const SEP: &[u8] = b"\0";

fn hash_hex(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(SEP);
        }
        hasher.update(part);
    }
    hasher.finalize().to_hex().to_string()
}

//─────────────────────────────
//  Id construction
//─────────────────────────────

/// Construct the deterministic `entity_id` for a FILE entity.
///
/// `"file_" + first_12_hex(BLAKE3(project_name || "\0" || absolute_path || "\0" || content_hash))`
pub fn file_entity_id(project_name: &str, absolute_path: &str, content_hash: &str) -> String {
    let digest = hash_hex(&[
        project_name.as_bytes(),
        absolute_path.as_bytes(),
        content_hash.as_bytes(),
    ]);
    format!("file_{}", &digest[..12])
}

/// Construct the deterministic `entity_id` for a DIRECTORY entity.
pub fn directory_entity_id(project_name: &str, absolute_path: &str) -> String {
    let digest = hash_hex(&[project_name.as_bytes(), absolute_path.as_bytes()]);
    format!("dir_{}", &digest[..12])
}

/// Construct the deterministic `entity_id` for a PROJECT entity.
pub fn project_entity_id(project_name: &str) -> String {
    let digest = hash_hex(&[project_name.as_bytes()]);
    format!("project_{}", &digest[..12])
}

/// Construct the deterministic `entity_id` for a nested entity owned by a
/// file (FUNCTION, CLASS, METHOD, VARIABLE, CONCEPT, PATTERN, CODE_EXAMPLE,
/// DOCUMENT).
///
/// `"{type_prefix}_" + first_12_hex(BLAKE3(owning_file_entity_id || "\0" || qualified_name))`
///
/// # Panics
/// Panics if `entity_type` is `File`, `Directory`, or `Project` — those
/// have their own dedicated constructors above and are not owned by a
/// file.
pub fn owned_entity_id(
    entity_type: EntityType,
    owning_file_entity_id: &str,
    qualified_name: &str,
) -> String {
    assert!(
        !matches!(
            entity_type,
            EntityType::File | EntityType::Directory | EntityType::Project
        ),
        "owned_entity_id is not valid for {entity_type:?}; use its dedicated constructor"
    );
    let digest = hash_hex(&[
        owning_file_entity_id.as_bytes(),
        qualified_name.as_bytes(),
    ]);
    format!("{}_{}", entity_type.id_prefix(), &digest[..12])
}

/// Construct the deterministic `relationship_id` for an edge.
///
/// `first_16_hex(BLAKE3(src_entity_id || "\0" || rel_type || "\0" || tgt_entity_id))`
pub fn relationship_id(source_entity_id: &str, relationship_type: &str, target_entity_id: &str) -> String {
    let digest = hash_hex(&[
        source_entity_id.as_bytes(),
        relationship_type.as_bytes(),
        target_entity_id.as_bytes(),
    ]);
    digest[..16].to_string()
}

//─────────────────────────────
//  Format validation
//─────────────────────────────

/// Every allowed entity-id prefix, derived from [`kg_types::ALL_ENTITY_TYPES`]
/// so this validator can never drift from the label enum.
fn allowed_prefixes() -> impl Iterator<Item = &'static str> {
    kg_types::ALL_ENTITY_TYPES.iter().map(|t| t.id_prefix())
}

/// Violations an entity id can fail with. A valid id matches
/// `^(file|dir|project|func|class|method|var|concept|pattern|example|doc)_[a-f0-9]{12,}$`
/// with no colon, slash, dot, whitespace, or uppercase character anywhere.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The id is empty.
    #[error("entity id is empty")]
    Empty,
    /// The id does not start with a recognised `{prefix}_` segment.
    #[error("entity id \"{0}\" does not start with a recognised type prefix")]
    UnknownPrefix(String),
    /// The hex segment after the prefix is too short or not lowercase hex.
    #[error("entity id \"{0}\" has a malformed hex segment")]
    MalformedHex(String),
    /// The id contains a forbidden character (`:`, `/`, `.`, whitespace, or
    /// an uppercase letter) — a sign the id leaked a raw path fragment
    /// instead of a derived hash.
    #[error("entity id \"{0}\" contains a forbidden character")]
    ForbiddenCharacter(String),
}

/// Validate an entity id's format. Every id constructor above funnels
/// through this, and any caller receiving an id from an external source
/// (e.g. a lookup result) should re-validate it before use.
pub fn validate_entity_id(id: &str) -> Result<(), IdentityError> {
    if id.is_empty() {
        return Err(IdentityError::Empty);
    }
    if id.chars().any(|c| {
        c == ':' || c == '/' || c == '.' || c.is_whitespace() || c.is_ascii_uppercase()
    }) {
        return Err(IdentityError::ForbiddenCharacter(id.to_string()));
    }
    let Some((prefix, hex)) = id.split_once('_') else {
        return Err(IdentityError::UnknownPrefix(id.to_string()));
    };
    if !allowed_prefixes().any(|p| p == prefix) {
        return Err(IdentityError::UnknownPrefix(id.to_string()));
    }
    if hex.len() < 12 || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(IdentityError::MalformedHex(id.to_string()));
    }
    Ok(())
}

/// Validate a relationship id: exactly 16 lowercase hex characters.
pub fn validate_relationship_id(id: &str) -> Result<(), IdentityError> {
    if id.len() != 16 || !id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(IdentityError::MalformedHex(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn file_entity_id_is_deterministic() {
        let a = file_entity_id("demo", "/src/main.py", "abc123");
        let b = file_entity_id("demo", "/src/main.py", "abc123");
        assert_eq!(a, b);
        assert!(validate_entity_id(&a).is_ok());
        assert!(a.starts_with("file_"));
    }

    #[test]
    fn different_content_hash_changes_file_id() {
        let a = file_entity_id("demo", "/src/main.py", "abc123");
        let b = file_entity_id("demo", "/src/main.py", "def456");
        assert_ne!(a, b);
    }

    #[test]
    fn owned_entity_id_rejects_file_level_types() {
        let result = std::panic::catch_unwind(|| {
            owned_entity_id(EntityType::File, "file_aaa", "foo")
        });
        assert!(result.is_err());
    }

    #[test]
    fn validator_rejects_forbidden_characters() {
        assert!(validate_entity_id("file_abc:def123456789").is_err());
        assert!(validate_entity_id("file_abc/def123456789").is_err());
        assert!(validate_entity_id("file_ABCDEF123456").is_err());
        assert!(validate_entity_id("file_abc def123456").is_err());
    }

    #[test]
    fn validator_rejects_unknown_prefix() {
        assert!(validate_entity_id("bogus_abcdef123456").is_err());
    }

    #[test]
    fn relationship_id_is_deterministic_and_valid() {
        let a = relationship_id("file_aaa", "imports", "file_bbb");
        let b = relationship_id("file_aaa", "imports", "file_bbb");
        assert_eq!(a, b);
        assert!(validate_relationship_id(&a).is_ok());
        assert_eq!(a.len(), 16);
    }

    proptest! {
        #[test]
        fn file_ids_for_arbitrary_inputs_are_valid_and_idempotent(
            project in "[a-zA-Z0-9_-]{1,20}",
            path in "/[a-zA-Z0-9_/.-]{1,40}",
            hash in "[a-f0-9]{8,64}",
        ) {
            let first = file_entity_id(&project, &path, &hash);
            let second = file_entity_id(&project, &path, &hash);
            prop_assert_eq!(&first, &second);
            prop_assert!(validate_entity_id(&first).is_ok());
            prop_assert!(!first.contains(':'));
        }
    }
}
