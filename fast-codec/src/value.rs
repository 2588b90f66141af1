//! Ring value conventions shared by the decode and encode reactors.
//!
//! Optional fields that are absent still occupy their full slot width in a
//! fragment; a sentinel value marks them. The sentinel must match exactly
//! between the two reactors or absence is silently re-encoded as data.

use fast_token::Token;

/// Default absent sentinel for int32 slots.
pub const ABSENT_INT32: i32 = i32::MIN;

/// Default absent sentinel for int64 slots.
pub const ABSENT_INT64: i64 = i64::MIN;

/// Absent sentinel for an int32-slot field, honoring the token's override
/// bit (fields whose value domain includes the default sentinel).
#[inline]
pub fn absent_int32(token: Token) -> i32 {
    if token.absent_override() {
        0
    } else {
        ABSENT_INT32
    }
}

/// Absent sentinel for an int64-slot field.
#[inline]
pub fn absent_int64(token: Token) -> i64 {
    if token.absent_override() {
        0
    } else {
        ABSENT_INT64
    }
}
