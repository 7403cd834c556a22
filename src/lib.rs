#![forbid(unsafe_code)]

pub mod adaptation;
pub mod config;
pub mod error;
pub mod ipc;
pub mod sched;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience
pub use crate::adaptation::{
    AdaptationLoop, Bypass, Command, Ctx, Endpoint, Method, Options, OptionsDecoder, Prober,
    ProtocolAdapter, Registry, ServiceInfo, ServiceKind, ServicePointer, ServiceRep, Transfer,
    VectPoint, run_loop,
};
pub use crate::config::{AdaptationConfig, Config, ConfigError, LoggingConfig, SharedMemConfig};
pub use crate::ipc::{PageId, PagePool, PoolError, PoolOwner, ProcessRole, SharedMemPages};
pub use crate::sched::{EventTimer, Firing, Handle, HandleTable, MonotonicClock, TargetId};
