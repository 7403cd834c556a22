//! The adaptation loop: one thread owns every service and drives them.
//!
//! Provides:
//! - `AdaptationLoop` - owns the timer, target table, registry, and the
//!   per-protocol probe collaborators; dispatches fired timer entries
//! - `Command` - requests other threads send into the loop
//! - `run_loop` - the production driver: sleeps until the next deadline
//!   or the next command, whichever comes first
//!
//! Tests drive the same loop with virtual time via `advance`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use crate::config::AdaptationConfig;
use crate::sched::{EventTimer, Firing, Handle, HandleTable, MonotonicClock, TargetId};

use super::options::Options;
use super::registry::Registry;
use super::service::{
    Ctx, ScheduledCall, ServiceEvent, ServiceInfo, ServicePointer, ServiceRep, WaiterCallback,
};
use super::uri::ServiceKind;

/// Transport half of an OPTIONS exchange. Returns the raw response bytes,
/// or None on unreachable/timeout. Implementations must bound their own
/// run time; the loop imposes no timeout of its own.
pub trait Prober {
    fn exchange(&mut self, service: &ServiceInfo) -> Option<Vec<u8>>;
}

/// Decoder half: raw response bytes to a capability record. None means the
/// response was not recognizably an OPTIONS response at all. `now` is the
/// loop time the decoder should map the response timestamp onto.
pub trait OptionsDecoder {
    fn decode(&self, raw: &[u8], now: Duration) -> Option<Options>;
}

/// The probe/decode pair for one protocol family.
pub struct ProtocolAdapter {
    pub prober: Box<dyn Prober>,
    pub decoder: Box<dyn OptionsDecoder>,
}

/// Requests other threads may send into the loop.
pub enum Command {
    /// Register a transaction as a waiter target; the handle comes back on
    /// the reply channel and is what `CallWhenReady` expects.
    RegisterTarget {
        description: String,
        reply: Sender<Handle>,
    },
    /// The transaction is gone; pending waiters for it will be dropped.
    ReleaseTarget { target: Handle },
    CallWhenReady {
        service: String,
        target: Handle,
        callback: Box<dyn FnOnce(&mut Ctx<'_>, ServicePointer) + Send>,
    },
    NoteFailure { service: String },
    Reconfigure {
        config: AdaptationConfig,
        services: Vec<ServiceInfo>,
    },
    Shutdown,
}

pub struct AdaptationLoop {
    timer: EventTimer<ScheduledCall>,
    targets: HandleTable<String>,
    registry: Registry,
    config: AdaptationConfig,
    adapters: HashMap<ServiceKind, ProtocolAdapter>,
    next_service_id: u64,
}

impl AdaptationLoop {
    pub fn new(config: AdaptationConfig) -> Self {
        AdaptationLoop {
            timer: EventTimer::new(),
            targets: HandleTable::new(),
            registry: Registry::new(),
            config,
            adapters: HashMap::new(),
            next_service_id: 0,
        }
    }

    pub fn install_adapter(&mut self, kind: ServiceKind, adapter: ProtocolAdapter) {
        self.adapters.insert(kind, adapter);
    }

    pub fn clock(&self) -> MonotonicClock {
        self.timer.clock()
    }

    pub fn now(&self) -> Duration {
        self.timer.now()
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn service(&self, identity: &str) -> Option<ServicePointer> {
        self.registry.lookup(identity)
    }

    /// Create, configure, and register a service.
    pub fn add_service(&mut self, info: ServiceInfo) -> ServicePointer {
        self.next_service_id += 1;
        let id = TargetId(self.next_service_id);
        let identity = info.identity.clone();
        let rc = Rc::new(RefCell::new(ServiceRep::new(info, id, self.timer.clock())));
        ServiceRep::configure(&rc);
        self.registry.add(Rc::clone(&rc));
        debug!(target: "adaptation", "registered adaptation service {identity}");
        rc
    }

    /// Install a new configuration: every current service is invalidated,
    /// then the new set is built. Waiters of old services observe the
    /// deconfigured service and must re-dispatch.
    pub fn reconfigure(&mut self, config: AdaptationConfig, services: Vec<ServiceInfo>) {
        info!(
            target: "adaptation",
            "reconfiguring: {} services replace {}",
            services.len(),
            self.registry.len()
        );
        let mut ctx = Ctx {
            timer: &mut self.timer,
            config: &self.config,
            targets: &self.targets,
        };
        self.registry.deconfigure_all(&mut ctx);
        self.config = config;
        for info in services {
            self.add_service(info);
        }
    }

    pub fn register_target(&mut self, description: impl Into<String>) -> Handle {
        self.targets.insert(description.into())
    }

    pub fn release_target(&mut self, target: Handle) {
        self.targets.release(target);
    }

    /// Ask `service` to call back when it is ready. Returns false when no
    /// such service is registered (e.g. it was just reconfigured away).
    pub fn call_when_ready(
        &mut self,
        service: &str,
        target: Handle,
        callback: WaiterCallback,
    ) -> bool {
        let Some(rc) = self.registry.lookup(service) else {
            warn!(target: "adaptation", "no adaptation service named {service}");
            return false;
        };
        let mut ctx = Ctx {
            timer: &mut self.timer,
            config: &self.config,
            targets: &self.targets,
        };
        ServiceRep::call_when_ready(&rc, &mut ctx, callback, target);
        true
    }

    pub fn note_failure(&mut self, service: &str) {
        let Some(rc) = self.registry.lookup(service) else {
            warn!(target: "adaptation", "failure noted for unknown service {service}");
            return;
        };
        let mut ctx = Ctx {
            timer: &mut self.timer,
            config: &self.config,
            targets: &self.targets,
        };
        ServiceRep::note_failure(&rc, &mut ctx);
    }

    /// Run every timer entry that is due at the current time.
    pub fn run_pending(&mut self) {
        while let Some(firing) = self.timer.pop_due() {
            self.dispatch(firing);
        }
    }

    /// Move virtual time forward and run what comes due.
    pub fn advance(&mut self, dt: Duration) {
        self.timer.advance(dt);
        self.run_pending();
    }

    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.timer.next_deadline()
    }

    fn dispatch(&mut self, firing: Firing<ScheduledCall>) {
        let ScheduledCall { service, event } = firing.payload;
        trace!(
            target: "adaptation",
            "dispatching {} for service {}",
            firing.name,
            service.borrow().identity()
        );
        match event {
            ServiceEvent::TimeToUpdate => {
                let mut ctx = Ctx {
                    timer: &mut self.timer,
                    config: &self.config,
                    targets: &self.targets,
                };
                ServiceRep::note_time_to_update(&service, &mut ctx);
            }
            ServiceEvent::Notify => {
                let mut ctx = Ctx {
                    timer: &mut self.timer,
                    config: &self.config,
                    targets: &self.targets,
                };
                ServiceRep::note_time_to_notify(&service, &mut ctx);
            }
            ServiceEvent::FetchOptions => {
                let fetched = self.fetch_options_for(&service);
                let mut ctx = Ctx {
                    timer: &mut self.timer,
                    config: &self.config,
                    targets: &self.targets,
                };
                ServiceRep::note_fetch_options(&service, &mut ctx, fetched);
            }
        }
    }

    /// Run the transport+decode collaborators for one probe. Deconfigured
    /// services are not probed at all.
    fn fetch_options_for(&mut self, service: &ServicePointer) -> Option<Options> {
        let (configured, kind, info) = {
            let s = service.borrow();
            (s.is_configured(), s.kind(), s.info().clone())
        };
        if !configured {
            return None;
        }
        let now = self.timer.now();
        let Some(adapter) = self.adapters.get_mut(&kind) else {
            warn!(
                target: "adaptation",
                "no {} protocol adapter for service {}",
                kind.as_str(),
                info.identity
            );
            return None;
        };
        let raw = adapter.prober.exchange(&info)?;
        adapter.decoder.decode(&raw, now)
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::RegisterTarget { description, reply } => {
                let handle = self.register_target(description);
                let _ = reply.send(handle);
            }
            Command::ReleaseTarget { target } => self.release_target(target),
            Command::CallWhenReady {
                service,
                target,
                callback,
            } => {
                self.call_when_ready(&service, target, callback);
            }
            Command::NoteFailure { service } => self.note_failure(&service),
            Command::Reconfigure { config, services } => self.reconfigure(config, services),
            Command::Shutdown => unreachable!("run_loop exits before dispatching Shutdown"),
        }
    }
}

/// How long the production loop sleeps when no timer is armed.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// The production driver. Owns the loop until `Shutdown` arrives or every
/// sender is gone. Commands are processed in arrival order; timers fire on
/// the same thread between commands.
pub fn run_loop(mut lp: AdaptationLoop, commands: Receiver<Command>) {
    let started = Instant::now();
    info!(target: "adaptation", "adaptation loop running");
    loop {
        lp.timer.advance_to(started.elapsed());
        lp.run_pending();

        let timeout = match lp.next_deadline() {
            Some(due) => due.saturating_sub(started.elapsed()),
            None => IDLE_POLL,
        };
        match commands.recv_timeout(timeout) {
            Ok(Command::Shutdown) => {
                info!(target: "adaptation", "adaptation loop shutting down");
                break;
            }
            Ok(command) => {
                lp.timer.advance_to(started.elapsed());
                lp.handle_command(command);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!(target: "adaptation", "all command senders dropped");
                break;
            }
        }
    }
}
