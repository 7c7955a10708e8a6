//! Generation-checked handles handed out by [`crate::Device`].
//!
//! A handle stays valid until the matching `destroy_*` call; reusing it after
//! that resolves to nothing instead of aliasing a newer object.

use slotmap::Key;

slotmap::new_key_type! {
    pub struct BufferId;
    pub struct TextureId;
    pub struct SamplerId;
    pub struct ShaderId;
}

/// Stable 64-bit identity of a shader handle, used inside pipeline keys.
#[inline]
pub(crate) fn shader_key(id: ShaderId) -> u64 {
    id.data().as_ffi()
}
