//! Internal utilities.
mod init;
pub(crate) mod intrusive_list;
mod prio_bitmap;
pub use self::{init::Init, prio_bitmap::PrioBitmap, prio_bitmap::TwoLevelBitmap};
