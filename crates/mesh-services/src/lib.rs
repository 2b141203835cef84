//! mesh-services — registry client, registrar, discovery, and framed sessions.

pub mod consul;
pub mod discovery;
pub mod dispatch;
pub mod memory;
pub mod registrar;
pub mod registry;
pub mod retry;
pub mod session;
pub mod telemetry;

pub use consul::ConsulRegistry;
pub use discovery::Discoverer;
pub use dispatch::{DispatchError, HandlerTable, MessageHandler};
pub use memory::MemoryRegistry;
pub use registrar::{RegistrationHandle, Registrar};
pub use registry::{
    HealthCheck, Registration, Registry, RegistryError, ServiceInstance, TransportKind,
};
pub use retry::RetryPolicy;
pub use session::{Connector, Identity, Session, SessionError, SessionOptions, SessionState, SessionTable};
