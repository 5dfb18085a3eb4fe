//! Preallocated containers: the caller owns the node storage and the node
//! type embeds the linkage, so the containers themselves never allocate.

pub mod rbtree;
pub mod slist;

pub use rbtree::{RbLinks, RbNode, RbTree};
pub use slist::{Slist, SlistIter, SlistNode};
