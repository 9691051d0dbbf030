//! Identifier helpers.
//!
//! Every entity id is a UUIDv7 minted client-side, so a unit of work can
//! allocate ids for the rows it stages without a round trip to storage.
//! The nil UUID stands for "no id given" and never resolves.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use taxa_core::ids::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Whether an id was actually supplied (i.e. is not the nil UUID).
#[inline]
pub fn is_present(id: &Uuid) -> bool {
    !id.is_nil()
}
