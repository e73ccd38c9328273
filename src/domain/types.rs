/// Identifier of a registered user. Valid identifiers are `>= 1`.
pub type UserId = i64;

/// Identifier of a persisted post.
pub type PostId = i64;

/// Returns true when `id` can refer to a stored user.
pub fn is_valid_user_id(id: UserId) -> bool {
    id > 0
}
