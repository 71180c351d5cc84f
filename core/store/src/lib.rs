//! Storage collaborator contracts for the CardStack sync engine.
//!
//! The engine never talks to a concrete database or transport. It is wired
//! against four narrow traits defined here: [`LocalStore`] (the on-device
//! database), [`RemoteStore`] (the remote upsert/query API), [`AuthProvider`]
//! (session lookup) and [`EventSink`] (lifecycle event publication). The
//! in-memory implementations in [`memory`] back the test suite and serve as
//! reference implementations.

pub mod auth;
pub mod events;
pub mod local;
pub mod memory;
pub mod record;
pub mod remote;

pub use auth::AuthProvider;
pub use events::{EventSink, SyncEvent};
pub use local::{LocalStore, LocalWrite, WriteBatch};
pub use memory::{MemoryEventSink, MemoryLocalStore, MemoryRemoteStore, StaticAuth};
pub use record::VersionedRecord;
pub use remote::RemoteStore;
