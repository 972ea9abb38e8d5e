//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by macros.
pub mod binary_heap;
mod init;
pub mod intrusive_list;
mod prio_bitmap;
pub use self::{init::*, prio_bitmap::*};
