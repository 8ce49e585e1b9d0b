mod allocator;
mod selector;

pub use allocator::*;
pub use selector::*;
