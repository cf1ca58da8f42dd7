use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OwnerKeyError {
    #[error("object key has no owner segment (expected <owner>/<path>): {0:?}")]
    NoOwnerSegment(String),
    #[error("object key has an empty owner segment: {0:?}")]
    EmptyOwner(String),
}

/// Derives the owner of a stored object from its key.
///
/// The owner is the first `/`-separated segment. Keys with a single segment (no `/`)
/// and keys starting with `/` do not name an owner.
pub fn owner_key(object_key: &str) -> Result<&str, OwnerKeyError> {
    let Some((owner, _rest)) = object_key.split_once('/') else {
        return Err(OwnerKeyError::NoOwnerSegment(object_key.to_string()));
    };
    if owner.is_empty() {
        return Err(OwnerKeyError::EmptyOwner(object_key.to_string()));
    }
    Ok(owner)
}
