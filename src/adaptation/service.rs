//! Service representation: the per-service availability state machine.
//!
//! Each configured adaptation service is tracked by a `ServiceRep` that
//! probes the service for capabilities, counts session failures, suspends
//! itself when they pile up, schedules its own revival, and notifies
//! transactions waiting for it to become usable.
//!
//! Everything here runs on the loop thread. A service holds a strong
//! reference to itself while configured; deconfiguration nullifies that
//! reference, and every scheduled callback checks it on entry. Waiters are
//! never notified synchronously: notification always bounces through a
//! zero-delay timer, so callbacks cannot re-enter the registration path.

use std::cell::RefCell;
use std::cmp;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::AdaptationConfig;
use crate::sched::{EventTimer, Handle, HandleTable, MonotonicClock, TargetId};

use super::options::{Method, Options, Transfer};
use super::uri::{Endpoint, ServiceKind};

const EV_UPDATE: &str = "ServiceRep::noteTimeToUpdate";
const EV_NOTIFY: &str = "ServiceRep::noteTimeToNotify";
const EV_FETCH: &str = "ServiceRep::fetchOptions";

/// Where in the proxy pipeline a service is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectPoint {
    None,
    PreCache,
    PostCache,
}

impl VectPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            VectPoint::None => "none",
            VectPoint::PreCache => "precache",
            VectPoint::PostCache => "postcache",
        }
    }
}

/// Whether a transaction may proceed without this service when it is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    /// The enclosing transaction must abort when the service is down.
    Essential,
    /// The transaction proceeds unadapted when the service is down.
    Optional,
}

impl Bypass {
    pub fn as_str(self) -> &'static str {
        match self {
            Bypass::Essential => "essential",
            Bypass::Optional => "optional",
        }
    }
}

/// Static description of one configured service.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub identity: String,
    pub method: Method,
    pub point: VectPoint,
    pub bypass: Bypass,
    pub endpoint: Endpoint,
    /// The raw configured URI, kept for log lines.
    pub uri: String,
}

pub type ServicePointer = Rc<RefCell<ServiceRep>>;

/// Invoked once when the service becomes usable (or terminally unusable;
/// callers must inspect the service and take their fallback path).
pub type WaiterCallback = Box<dyn FnOnce(&mut Ctx<'_>, ServicePointer)>;

/// Timer payload: which service method to run when the entry fires.
///
/// The strong reference keeps a deconfigured service alive until its last
/// scheduled event has fired; the callbacks themselves no-op on a nulled
/// self-reference.
#[derive(Clone)]
pub struct ScheduledCall {
    pub service: ServicePointer,
    pub event: ServiceEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    TimeToUpdate,
    FetchOptions,
    Notify,
}

/// Loop facilities a service method may use.
pub struct Ctx<'a> {
    pub timer: &'a mut EventTimer<ScheduledCall>,
    pub config: &'a AdaptationConfig,
    pub targets: &'a HandleTable<String>,
}

struct Waiter {
    callback: WaiterCallback,
    target: Handle,
}

pub struct ServiceRep {
    id: TargetId,
    info: ServiceInfo,
    clock: MonotonicClock,
    options: Option<Options>,
    session_failures: u32,
    suspended: Option<String>,
    last_update: Option<Duration>,
    update_scheduled: bool,
    fetching: bool,
    notifying: bool,
    waiters: VecDeque<Waiter>,
    self_ref: Option<ServicePointer>,
    announced_up: bool,
}

impl ServiceRep {
    pub fn new(info: ServiceInfo, id: TargetId, clock: MonotonicClock) -> ServiceRep {
        ServiceRep {
            id,
            info,
            clock,
            options: None,
            session_failures: 0,
            suspended: None,
            last_update: None,
            update_scheduled: false,
            fetching: false,
            notifying: false,
            waiters: VecDeque::new(),
            self_ref: None,
            // do not announce an "up" service at startup
            announced_up: true,
        }
    }

    /// Install the strong self-reference. One-shot: a second call is a
    /// programmer error.
    pub fn configure(rc: &ServicePointer) {
        let mut s = rc.borrow_mut();
        assert!(
            s.self_ref.is_none(),
            "service {} configured twice",
            s.info.identity
        );
        s.self_ref = Some(Rc::clone(rc));
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub fn identity(&self) -> &str {
        &self.info.identity
    }

    pub fn kind(&self) -> ServiceKind {
        self.info.endpoint.kind
    }

    pub fn is_configured(&self) -> bool {
        self.self_ref.is_some()
    }

    pub fn failure_count(&self) -> u32 {
        self.session_failures
    }

    pub fn suspended_reason(&self) -> Option<&str> {
        self.suspended.as_deref()
    }

    fn has_options(&self) -> bool {
        matches!(&self.options, Some(o) if o.valid() && o.fresh(self.clock.now()))
    }

    pub fn up(&self) -> bool {
        self.self_ref.is_some() && self.suspended.is_none() && self.has_options()
    }

    pub fn probed(&self) -> bool {
        self.last_update.is_some()
    }

    pub fn broken(&self) -> bool {
        self.probed() && !self.up()
    }

    fn needs_new_options(&self) -> bool {
        self.self_ref.is_some() && !self.up()
    }

    fn usable_options(&self) -> &Options {
        match &self.options {
            Some(o) if o.valid() && o.fresh(self.clock.now()) => o,
            _ => panic!(
                "service {} queried without usable options {}",
                self.info.identity,
                self.status()
            ),
        }
    }

    /// Whether the service wants to see this URL at all.
    pub fn wants_url(&self, url_path: &str) -> bool {
        self.usable_options().transfer_kind(url_path) != Transfer::Ignore
    }

    /// Preview size for this URL, if the service asked to preview it.
    pub fn wants_preview(&self, url_path: &str) -> Option<usize> {
        let opts = self.usable_options();
        let size = opts.preview?;
        if opts.transfer_kind(url_path) != Transfer::Preview {
            return None;
        }
        Some(size)
    }

    pub fn allows_204(&self) -> bool {
        self.usable_options().allow_204
    }

    /// Register a waiter to be called back once, when the service becomes
    /// usable or terminally unusable. Precondition: the service is
    /// configured and not broken.
    pub fn call_when_ready(
        rc: &ServicePointer,
        ctx: &mut Ctx<'_>,
        callback: WaiterCallback,
        target: Handle,
    ) {
        let action = {
            let mut s = rc.borrow_mut();
            let who = ctx
                .targets
                .get(target)
                .map(String::as_str)
                .unwrap_or("<gone>");
            debug!(
                target: "adaptation",
                "service {} asked to call {} when ready {}",
                s.info.identity,
                who,
                s.status()
            );
            assert!(
                s.self_ref.is_some(),
                "waiting for deconfigured service {}",
                s.info.identity
            );
            assert!(
                !s.broken(),
                "waiting for broken service {} {}",
                s.info.identity,
                s.status()
            );

            s.waiters.push_back(Waiter { callback, target });

            if s.fetching || s.notifying {
                // picked up by the notification that follows
                None
            } else if s.needs_new_options() {
                Some(ServiceEvent::FetchOptions)
            } else {
                Some(ServiceEvent::Notify)
            }
        };
        match action {
            Some(ServiceEvent::FetchOptions) => Self::start_getting_options(rc, ctx),
            Some(ServiceEvent::Notify) => Self::schedule_notification(rc, ctx),
            _ => {}
        }
    }

    /// A transaction using this service failed.
    pub fn note_failure(rc: &ServicePointer, ctx: &mut Ctx<'_>) {
        let suspend_now = {
            let mut s = rc.borrow_mut();
            s.session_failures += 1;
            let limit = ctx.config.service_failure_limit;
            debug!(
                target: "adaptation",
                "{} service failures, out of {} allowed {}",
                s.session_failures,
                limit,
                s.status()
            );
            if s.suspended.is_some() {
                false // further failures do not shorten the revival
            } else {
                limit >= 0 && i64::from(s.session_failures) > i64::from(limit)
            }
        };
        if suspend_now {
            Self::suspend(rc, ctx, "too many failures");
        }
    }

    fn suspend(rc: &ServicePointer, ctx: &mut Ctx<'_>, reason: &str) {
        let when = {
            let mut s = rc.borrow_mut();
            if s.suspended.is_some() {
                debug!(
                    target: "adaptation",
                    "keeping service {} suspended, also for {}",
                    s.info.identity,
                    reason
                );
                return;
            }
            s.suspended = Some(reason.to_string());
            info!(
                target: "adaptation",
                "suspending service {} for {}",
                s.info.uri,
                reason
            );
            ctx.timer.now() + ctx.config.revival_delay()
        };
        Self::schedule_update(rc, ctx, when);
        rc.borrow_mut().announce_status_change("suspended", true);
    }

    /// Deconfigure the service. Idempotent. Scheduled callbacks observe the
    /// nulled self-reference and become no-ops; pending waiters are still
    /// drained so they can take their fallback path.
    pub fn invalidate(rc: &ServicePointer, ctx: &mut Ctx<'_>) {
        let saved = {
            let mut s = rc.borrow_mut();
            let Some(saved) = s.self_ref.take() else {
                trace!(
                    target: "adaptation",
                    "service {} is already invalidated",
                    s.info.identity
                );
                return;
            };
            s.announce_status_change("invalidated by reconfigure", false);
            saved
        };
        let drain = {
            let s = rc.borrow();
            !s.waiters.is_empty() && !s.notifying
        };
        if drain {
            Self::schedule_notification(rc, ctx);
        }
        drop(saved); // possibly the last strong reference besides timers
    }

    /// Timer entry point: a scheduled probe came due.
    pub fn note_time_to_update(rc: &ServicePointer, ctx: &mut Ctx<'_>) {
        let start = {
            let mut s = rc.borrow_mut();
            if s.self_ref.is_some() {
                s.update_scheduled = false;
            }
            if s.self_ref.is_none() {
                trace!(
                    target: "adaptation",
                    "service ignores options update {}",
                    s.status()
                );
                false
            } else {
                debug!(
                    target: "adaptation",
                    "service {} performs a regular options update {}",
                    s.info.identity,
                    s.status()
                );
                true
            }
        };
        if start {
            Self::start_getting_options(rc, ctx);
        }
    }

    /// Timer entry point: drain the waiter queue, in registration order.
    /// Runs to emptiness, so waiters added by callbacks are drained in the
    /// same run. Notifies even when the service has been invalidated.
    pub fn note_time_to_notify(rc: &ServicePointer, ctx: &mut Ctx<'_>) {
        {
            let mut s = rc.borrow_mut();
            assert!(
                !s.notifying,
                "re-entrant notification on service {}",
                s.info.identity
            );
            s.notifying = true;
            trace!(
                target: "adaptation",
                "service {} notifies {} waiters {}",
                s.info.identity,
                s.waiters.len(),
                s.status()
            );
        }
        loop {
            let waiter = rc.borrow_mut().waiters.pop_front();
            let Some(w) = waiter else { break };
            if ctx.targets.valid(w.target) {
                // rc keeps the service alive for the callback's duration
                (w.callback)(&mut *ctx, Rc::clone(rc));
            } else {
                trace!(target: "adaptation", "dropping waiter with a dead target");
            }
        }
        rc.borrow_mut().notifying = false;
    }

    /// Timer entry point: the zero-delay fetch event fired; `fetched` holds
    /// the decoded options, or None on transport/decode failure or when the
    /// service was deconfigured before the probe ran.
    pub fn note_fetch_options(rc: &ServicePointer, ctx: &mut Ctx<'_>, fetched: Option<Options>) {
        let configured = {
            let mut s = rc.borrow_mut();
            debug_assert!(s.fetching, "fetch completion without a fetch in flight");
            s.fetching = false;
            s.self_ref.is_some()
        };
        if !configured {
            let drain = {
                let s = rc.borrow();
                trace!(
                    target: "adaptation",
                    "deconfigured service {} discards fetched options {}",
                    s.info.identity,
                    s.status()
                );
                !s.waiters.is_empty() && !s.notifying
            };
            if drain {
                Self::schedule_notification(rc, ctx);
            }
            return;
        }
        Self::handle_new_options(rc, ctx, fetched);
    }

    fn handle_new_options(rc: &ServicePointer, ctx: &mut Ctx<'_>, new: Option<Options>) {
        Self::change_options(rc, ctx, new);
        let when = {
            let s = rc.borrow();
            debug!(
                target: "adaptation",
                "service {} got new options and is now {}",
                s.info.identity,
                s.status()
            );
            s.options_fetch_time(ctx)
        };
        Self::schedule_update(rc, ctx, when);
        Self::schedule_notification(rc, ctx);
    }

    /// Replace the options record, even with nothing. Resets the failure
    /// count and any suspension; this is the only path that revives a
    /// suspended service.
    fn change_options(rc: &ServicePointer, ctx: &mut Ctx<'_>, new: Option<Options>) {
        let mut s = rc.borrow_mut();
        trace!(
            target: "adaptation",
            "service {} changes options {}",
            s.info.identity,
            s.status()
        );
        s.options = new;
        s.session_failures = 0;
        s.suspended = None;
        s.last_update = Some(ctx.timer.now());
        s.check_options(ctx.timer.now());
        s.announce_status_change("down after an options fetch failure", true);
    }

    fn check_options(&self, now: Duration) {
        let Some(opts) = &self.options else { return };

        if !opts.valid() {
            warn!(
                target: "adaptation",
                "WARNING: invalid OPTIONS response from service {}; error: {}",
                self.info.uri,
                opts.error.as_deref().unwrap_or("unknown")
            );
            return;
        }

        // warn when the response declares methods and ours is not among them
        if !opts.methods.is_empty() && !opts.methods.contains(&self.info.method) {
            let declared: Vec<&str> = opts.methods.iter().map(|m| m.as_str()).collect();
            warn!(
                target: "adaptation",
                "WARNING: configured to use method {} for service {} \
                 but the OPTIONS response declares the methods are {}",
                self.info.method.as_str(),
                self.info.uri,
                declared.join(" ")
            );
        }

        let skew = opts.clock_skew(now);
        if skew > opts.ttl() {
            warn!(
                target: "adaptation",
                "service clock is skewed by {}s: {}",
                skew.as_secs(),
                self.info.uri
            );
        }
    }

    /// When the next OPTIONS fetch should happen: shortly before the
    /// current options expire, or after the revival delay when there are
    /// no valid options to go by.
    fn options_fetch_time(&self, ctx: &Ctx<'_>) -> Duration {
        let now = self.clock.now();
        if let Some(opts) = &self.options {
            if opts.valid() {
                let expire = opts.expire();
                trace!(
                    target: "adaptation",
                    "service {} options expire at {:?}",
                    self.info.identity,
                    expire
                );
                return cmp::max(now, expire.saturating_sub(ctx.config.probe_lead()));
            }
        }
        now + ctx.config.revival_delay()
    }

    /// Arrange for a probe at `when`, clamped to now and to the minimum
    /// gap since the last probe so a misbehaving service cannot draw a
    /// reprobe storm. The `update_scheduled` flag is the single source of
    /// truth; a timer the flag promises but `exists` cannot find is logged
    /// and tolerated.
    fn schedule_update(rc: &ServicePointer, ctx: &mut Ctx<'_>, mut when: Duration) {
        let mut s = rc.borrow_mut();
        if s.update_scheduled {
            trace!(
                target: "adaptation",
                "service {} reschedules its update",
                s.info.identity
            );
            if ctx.timer.exists(EV_UPDATE, s.id) {
                ctx.timer.cancel(EV_UPDATE, s.id);
            } else {
                warn!(
                    target: "adaptation",
                    "service {} lost an update event",
                    s.info.identity
                );
            }
            s.update_scheduled = false;
        }

        let now = ctx.timer.now();
        trace!(
            target: "adaptation",
            "raw OPTIONS fetch at {:?}, or in {:?}",
            when,
            when.saturating_sub(now)
        );
        if when < now {
            when = now;
        }
        if let Some(last) = s.last_update {
            let earliest = last + ctx.config.update_gap();
            if when < earliest {
                when = earliest;
            }
        }
        let delay = when - now;
        debug!(
            target: "adaptation",
            "service {} will fetch OPTIONS in {:?}",
            s.info.identity,
            delay
        );
        ctx.timer.schedule(
            EV_UPDATE,
            s.id,
            delay,
            None,
            ScheduledCall {
                service: Rc::clone(rc),
                event: ServiceEvent::TimeToUpdate,
            },
        );
        s.update_scheduled = true;
    }

    /// Begin one OPTIONS exchange. At most one may be in flight.
    fn start_getting_options(rc: &ServicePointer, ctx: &mut Ctx<'_>) {
        let id = {
            let mut s = rc.borrow_mut();
            assert!(
                !s.fetching,
                "second options fetch started on service {}",
                s.info.identity
            );
            debug!(
                target: "adaptation",
                "service {} will fetch new options {}",
                s.info.identity,
                s.status()
            );
            s.fetching = true;
            s.id
        };
        ctx.timer.schedule(
            EV_FETCH,
            id,
            Duration::ZERO,
            None,
            ScheduledCall {
                service: Rc::clone(rc),
                event: ServiceEvent::FetchOptions,
            },
        );
    }

    /// Waiters are notified from a fresh scheduler turn, never from inside
    /// the call that made the service ready.
    fn schedule_notification(rc: &ServicePointer, ctx: &mut Ctx<'_>) {
        let (id, pending) = {
            let s = rc.borrow();
            (s.id, s.waiters.len())
        };
        trace!(target: "adaptation", "service will notify {pending} waiters");
        ctx.timer.schedule(
            EV_NOTIFY,
            id,
            Duration::ZERO,
            None,
            ScheduledCall {
                service: Rc::clone(rc),
                event: ServiceEvent::Notify,
            },
        );
    }

    /// Log an availability transition, once per transition: repeated calls
    /// while the answer to `up()` is unchanged stay quiet.
    fn announce_status_change(&mut self, down_phrase: &str, important: bool) {
        if self.announced_up == self.up() {
            return; // no significant changes to announce
        }
        let what = self.info.bypass.as_str();
        let state = if self.announced_up { down_phrase } else { "up" };
        if important {
            info!(
                target: "adaptation",
                "{} {} service is {}: {} {}",
                what,
                self.kind().as_str(),
                state,
                self.info.uri,
                self.status()
            );
        } else {
            debug!(
                target: "adaptation",
                "{} {} service is {}: {} {}",
                what,
                self.kind().as_str(),
                state,
                self.info.uri,
                self.status()
            );
        }
        self.announced_up = !self.announced_up;
    }

    /// Short bracketed diagnostic, e.g. `[down,susp,stale,fail3]`.
    pub fn status(&self) -> String {
        let now = self.clock.now();
        let mut buf = String::from("[");
        if self.up() {
            buf.push_str("up");
        } else {
            buf.push_str("down");
            if self.self_ref.is_none() {
                buf.push_str(",gone");
            }
            if self.suspended.is_some() {
                buf.push_str(",susp");
            }
            match &self.options {
                None => buf.push_str(",!opt"),
                Some(o) if !o.valid() => buf.push_str(",!valid"),
                Some(o) if !o.fresh(now) => buf.push_str(",stale"),
                Some(_) => {}
            }
        }
        if self.fetching {
            buf.push_str(",fetch");
        }
        if self.notifying {
            buf.push_str(",notif");
        }
        if self.session_failures > 0 {
            buf.push_str(&format!(",fail{}", self.session_failures));
        }
        buf.push(']');
        buf
    }
}
