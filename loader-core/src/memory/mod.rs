//! Local code memory for interception stubs.

pub mod allocator;
pub mod writer;

pub use allocator::ExecutableMemory;
pub use writer::write_protected;
