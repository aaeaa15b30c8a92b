//! Utility
pub mod binary_heap;
mod index_set;
pub mod intrusive_list;
mod prio_bitmap;
pub use self::{index_set::*, prio_bitmap::*};
