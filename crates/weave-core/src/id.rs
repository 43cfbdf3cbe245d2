//! Identity types
//!
//! Scene objects carry a stable numeric identity that survives renames;
//! reference names are derived from the human-readable name and, on
//! collision, suffixed with this identity.

use std::fmt;

/// Stable identity of a live scene object, unique within one scene
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(pub u64);

impl ObjectId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ObjectId(id)
    }

    /// Suffix used to de-collide reference names (`name_<id>`)
    #[inline]
    pub fn suffix(self) -> String {
        format!("_{}", self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Obj({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_suffix() {
        assert_eq!(ObjectId::new(12).suffix(), "_12");
    }
}
