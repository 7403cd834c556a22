//! Content adaptation service registry.
//!
//! Provides:
//! - Service representation with availability tracking and suspension
//! - Capability (OPTIONS) cache with freshness and TTL
//! - Identity-keyed registry with reconfigure semantics
//! - Waiter notification for transactions awaiting a usable service
//! - The single-threaded loop that drives probes and timers

pub mod driver;
pub mod options;
pub mod registry;
pub mod service;
pub mod uri;

pub use driver::{
    AdaptationLoop, Command, OptionsDecoder, Prober, ProtocolAdapter, run_loop,
};
pub use options::{Method, Options, Transfer};
pub use registry::Registry;
pub use service::{
    Bypass, Ctx, ScheduledCall, ServiceEvent, ServiceInfo, ServicePointer, ServiceRep, VectPoint,
    WaiterCallback,
};
pub use uri::{parse_endpoint, Endpoint, ServiceKind, UriError};
