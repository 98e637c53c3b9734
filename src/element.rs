use serde_json::Value;

use crate::error::CacheError;

/// The full, unrestricted representation of one element: a JSON object
/// mapping field names to values. Every element carries a numeric `"id"`
/// field.
pub type FullData = serde_json::Map<String, Value>;

/// Identifies a viewer. `0` is the anonymous user.
pub type UserId = u64;

pub const ANONYMOUS_USER_ID: UserId = 0;

/// Marker field embedded into cached elements. When set, an element that a
/// viewer loses access to is reported as changed (with reduced fields) or
/// simply omitted, instead of being reported as deleted.
pub const NO_DELETE_ON_RESTRICTION_FIELD: &str = "_no_delete_on_restriction";

/// Builds the canonical element id `"collection:id"`.
pub fn element_id(collection: &str, id: u64) -> String {
    format!("{collection}:{id}")
}

/// Splits `"collection:id"` back into its parts.
///
/// Element ids with an embedded colon in the collection part are supported;
/// only the last colon separates the numeric id.
pub fn split_element_id(element_id: &str) -> Result<(&str, u64), CacheError> {
    let (collection, id) = element_id
        .rsplit_once(':')
        .ok_or_else(|| CacheError::MalformedElementId(element_id.to_owned()))?;
    let id = id
        .parse::<u64>()
        .map_err(|_| CacheError::MalformedElementId(element_id.to_owned()))?;
    Ok((collection, id))
}

/// Reads the mandatory numeric `"id"` field of an element.
pub fn full_data_id(collection: &str, element: &FullData) -> Result<u64, CacheError> {
    element
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| CacheError::MissingElementId {
            collection: collection.to_owned(),
        })
}

/// Removes the restriction marker from an element. Returns whether the
/// marker was present and truthy.
pub(crate) fn take_restriction_marker(element: &mut FullData) -> bool {
    element
        .remove(NO_DELETE_ON_RESTRICTION_FIELD)
        .map_or(false, |value| value.as_bool().unwrap_or(false))
}
