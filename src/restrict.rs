use crate::{
    element::{FullData, UserId},
    error::CacheError,
    traits::PermissionService,
};

/// The most common restriction policy: one permission gates the whole
/// collection. Viewers with the permission see everything, viewers without
/// it see nothing.
///
/// A failing permission service is not "no access": the error propagates so
/// the caller can skip this viewer's push for the round instead of telling
/// the client its data was deleted.
pub async fn by_permission(
    permissions: &dyn PermissionService,
    permission: &str,
    user_id: Option<UserId>,
    elements: Vec<FullData>,
) -> Result<Vec<FullData>, CacheError> {
    if permissions.has_perm(user_id, permission).await? {
        Ok(elements)
    }
    else {
        Ok(Vec::new())
    }
}
