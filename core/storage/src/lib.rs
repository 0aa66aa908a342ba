//! Persistent key/value storage for the memory vault.
//!
//! The vault keeps a handful of small records (settings, session, usage
//! state) in a store that must survive the host process being killed. This
//! crate defines the store interface and two implementations:
//!
//! - [`MemoryStore`]: shared in-process backend, used for tests and for
//!   hosts that persist elsewhere
//! - [`LocalStore`]: one JSON file per key in a directory, written atomically
//!
//! # Design Principles
//! - Every `set` and `remove` is durable when it returns
//! - Change notifications are best-effort broadcasts tagged with the
//!   writing context, so observers can skip their own writes

pub mod local;
pub mod memory;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use store::{validate_key, ChangeKind, ContextId, KeyValueStore, StoreChange};
