//! Spaces - groups of regions with a shared allocation policy.
//!
//! - `SemiSpace`: young objects, bump allocation, copied by young GC
//! - `SparseSpace`: old, non-movable and machine-code objects, free-list
//!   allocation, swept (old space may also be compacted)
//! - `HugeObjectSpace`: one region per object larger than the regular limit

mod free_list;
mod huge_object_space;
mod semi_space;
mod sparse_space;

pub use free_list::FreeObjectList;
pub use huge_object_space::HugeObjectSpace;
pub use semi_space::SemiSpace;
pub use sparse_space::SparseSpace;

/// The space an allocation is requested in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpaceType {
    Young,
    Old,
    NonMovable,
    HugeObject,
    MachineCode,
}

impl SpaceType {
    pub fn name(self) -> &'static str {
        match self {
            SpaceType::Young => "young",
            SpaceType::Old => "old",
            SpaceType::NonMovable => "non-movable",
            SpaceType::HugeObject => "huge-object",
            SpaceType::MachineCode => "machine-code",
        }
    }
}
