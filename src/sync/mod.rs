pub mod lock_free_stack;
pub mod monitor;
pub mod note;
pub mod shared_vars;

pub use lock_free_stack::{IndexLinks, LockFreeStack};
pub use monitor::{Monitor, MonitorLock};
pub use note::Note;
pub use shared_vars::{SharedEnum, SharedEnumFlag, SharedFlag};
