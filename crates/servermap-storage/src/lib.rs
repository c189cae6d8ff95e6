mod fjall_store;
mod memory;

pub use fjall_store::FjallTraceStore;
pub use memory::MemoryTraceStore;
