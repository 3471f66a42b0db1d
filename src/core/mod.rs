/// Engine side of the HBUS master
///
/// This package contains everything between the wire codec and the
/// collaborator API:
/// - Response registry and bus lock tracking
/// - Device/object model and registry
/// - Enumeration pipeline and supervisor
/// - Request/event messages and the async driver loop
pub mod arbiter;
pub mod bus;
pub mod device;
pub mod enumeration;
pub mod master;
pub mod pending;
pub mod registry;
pub mod runtime;
pub mod supervisor;
pub mod task_manager;

// Re-export commonly used types
pub use bus::{EventKind, MasterEvent, MasterRequest};
pub use master::{Master, MasterState};
pub use runtime::{run_master, RuntimeConfig};
