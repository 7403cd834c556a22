//! Integration tests for the adaptation service lifecycle: probing,
//! suspension and revival, waiter notification, and reconfiguration.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remora::config::parse_service_line;
use remora::{
    AdaptationConfig, AdaptationLoop, Command, Ctx, EventTimer, HandleTable, Method, Options,
    OptionsDecoder, Prober, ProtocolAdapter, ServiceInfo, ServiceKind, ServicePointer, ServiceRep,
    TargetId, Transfer, run_loop,
};

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

// =============================================================================
// Stub probe collaborators
// =============================================================================

/// What one planned OPTIONS exchange yields.
#[derive(Clone, Default)]
struct Reply {
    ttl: u64,
    preview: Option<usize>,
    methods: Vec<Method>,
    /// Seconds the stamped timestamp is ahead (+) or behind (-) of now.
    skew: i64,
    error: Option<&'static str>,
    /// Make the service want a preview of everything.
    preview_all: bool,
}

#[derive(Clone)]
enum ProbePlan {
    /// Transport failure: no response at all.
    Unreachable,
    /// A response arrives but the decoder rejects it outright.
    Undecodable,
    Respond(Reply),
}

fn ok_reply(ttl: u64) -> ProbePlan {
    ProbePlan::Respond(Reply {
        ttl,
        methods: vec![Method::Reqmod],
        ..Reply::default()
    })
}

type Plan = Rc<RefCell<VecDeque<ProbePlan>>>;
type Pending = Rc<RefCell<Option<ProbePlan>>>;

struct StubProber {
    plan: Plan,
    pending: Pending,
}

impl Prober for StubProber {
    fn exchange(&mut self, _service: &ServiceInfo) -> Option<Vec<u8>> {
        // an exhausted plan behaves like an unreachable service
        let next = self.plan.borrow_mut().pop_front()?;
        match next {
            ProbePlan::Unreachable => None,
            other => {
                *self.pending.borrow_mut() = Some(other);
                Some(b"OPTIONS response".to_vec())
            }
        }
    }
}

struct StubDecoder {
    pending: Pending,
}

impl OptionsDecoder for StubDecoder {
    fn decode(&self, _raw: &[u8], now: Duration) -> Option<Options> {
        match self.pending.borrow_mut().take()? {
            ProbePlan::Undecodable => None,
            ProbePlan::Respond(reply) => {
                let timestamp = if reply.skew >= 0 {
                    now + secs(reply.skew as u64)
                } else {
                    now.saturating_sub(secs(reply.skew.unsigned_abs()))
                };
                let mut opts = Options::new(timestamp);
                opts.ttl = Some(secs(reply.ttl));
                opts.preview = reply.preview;
                opts.methods = reply.methods;
                opts.error = reply.error.map(str::to_string);
                if reply.preview_all {
                    opts.default_transfer = Transfer::Preview;
                }
                Some(opts)
            }
            ProbePlan::Unreachable => unreachable!("unreachable plans never reach the decoder"),
        }
    }
}

// =============================================================================
// Fixture
// =============================================================================

#[derive(Debug, Clone)]
struct Observation {
    up: bool,
    gone: bool,
    status: String,
}

struct Fixture {
    lp: AdaptationLoop,
    plan: Plan,
}

impl Fixture {
    fn new(config: AdaptationConfig) -> Self {
        let mut lp = AdaptationLoop::new(config);
        let plan: Plan = Rc::new(RefCell::new(VecDeque::new()));
        let pending: Pending = Rc::new(RefCell::new(None));
        lp.install_adapter(
            ServiceKind::Icap,
            ProtocolAdapter {
                prober: Box::new(StubProber {
                    plan: Rc::clone(&plan),
                    pending: Rc::clone(&pending),
                }),
                decoder: Box::new(StubDecoder { pending }),
            },
        );
        Fixture { lp, plan }
    }

    fn push(&self, plan: ProbePlan) {
        self.plan.borrow_mut().push_back(plan);
    }

    fn add_icap(&mut self, identity: &str) -> ServicePointer {
        let line = format!("{identity} reqmod_precache 0 icap://h:1344/r");
        self.lp.add_service(parse_service_line(&line).unwrap())
    }

    /// Register a transaction and a waiter that records what it observes.
    fn watch(&mut self, identity: &str, label: &str) -> Rc<RefCell<Vec<Observation>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let target = self.lp.register_target(label);
        self.lp.call_when_ready(
            identity,
            target,
            Box::new(move |_ctx: &mut Ctx, service: ServicePointer| {
                let s = service.borrow();
                sink.borrow_mut().push(Observation {
                    up: s.up(),
                    gone: !s.is_configured(),
                    status: s.status(),
                });
            }),
        );
        seen
    }
}

fn config(failure_limit: i32, revival: u64, gap: u64) -> AdaptationConfig {
    AdaptationConfig {
        service_failure_limit: failure_limit,
        service_revival_delay: revival,
        min_update_gap: gap,
        ..AdaptationConfig::default()
    }
}

// =============================================================================
// Log capture (announcement and warning assertions)
// =============================================================================

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
    type Writer = Capture;

    fn make_writer(&'a self) -> Capture {
        self.clone()
    }
}

fn with_captured_logs<R>(run: impl FnOnce() -> R) -> (R, String) {
    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, run);
    let logs = capture.contents();
    (result, logs)
}

// =============================================================================
// Cold start and probing
// =============================================================================

#[test]
fn cold_start_fires_waiter_and_schedules_refresh_before_expiry() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ProbePlan::Respond(Reply {
        ttl: 60,
        preview: Some(128),
        methods: vec![Method::Reqmod],
        ..Reply::default()
    }));
    let s1 = fx.add_icap("s1");
    let seen = fx.watch("s1", "W1");

    fx.lp.run_pending();

    let obs = seen.borrow();
    assert_eq!(obs.len(), 1, "waiter fired exactly once");
    assert!(obs[0].up);
    assert!(s1.borrow().up());
    assert_eq!(s1.borrow().status(), "[up]");
    // next probe leads expiry by the expected probe duration: 60 - 20
    assert_eq!(fx.lp.next_deadline(), Some(secs(40)));
}

#[test]
fn unreachable_service_leaves_waiter_observing_down() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ProbePlan::Unreachable);
    let s1 = fx.add_icap("s1");
    let seen = fx.watch("s1", "W1");

    fx.lp.run_pending();

    let obs = seen.borrow();
    assert_eq!(obs.len(), 1);
    assert!(!obs[0].up);
    assert!(obs[0].status.contains("!opt"));
    assert!(s1.borrow().broken());
    // a service without valid options reprobes after the revival delay
    assert_eq!(fx.lp.next_deadline(), Some(secs(180)));
}

#[test]
fn undecodable_response_leaves_the_service_broken() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ProbePlan::Undecodable);
    let s1 = fx.add_icap("s1");
    fx.watch("s1", "W1");

    fx.lp.run_pending();

    assert!(s1.borrow().broken());
    assert!(s1.borrow().status().contains("!opt"));
}

#[test]
fn invalid_options_record_is_kept_but_unusable() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ProbePlan::Respond(Reply {
        ttl: 60,
        error: Some("truncated ISTag"),
        ..Reply::default()
    }));
    let s1 = fx.add_icap("s1");
    fx.watch("s1", "W1");

    fx.lp.run_pending();

    assert!(!s1.borrow().up());
    assert!(s1.borrow().broken());
    assert!(s1.borrow().status().contains("!valid"));
}

#[test]
fn preview_disposition_comes_from_the_installed_options() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ProbePlan::Respond(Reply {
        ttl: 60,
        preview: Some(128),
        methods: vec![Method::Reqmod],
        preview_all: true,
        ..Reply::default()
    }));
    let s1 = fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending();

    let s = s1.borrow();
    assert!(s.wants_url("/download/file.bin"));
    assert_eq!(s.wants_preview("/download/file.bin"), Some(128));
    assert!(s.allows_204());
}

// =============================================================================
// Failures, suspension, revival
// =============================================================================

#[test]
fn repeated_failures_suspend_and_schedule_revival() {
    let mut fx = Fixture::new(config(2, 10, 0));
    fx.push(ok_reply(60));
    fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending();

    let s1 = fx.lp.service("s1").unwrap();
    assert!(s1.borrow().up());

    fx.lp.advance(secs(1));
    fx.lp.note_failure("s1");
    fx.lp.advance(secs(1));
    fx.lp.note_failure("s1");
    assert!(s1.borrow().suspended_reason().is_none(), "at the limit, not past it");

    fx.lp.advance(secs(1));
    fx.lp.note_failure("s1"); // third failure crosses limit=2
    assert_eq!(s1.borrow().suspended_reason(), Some("too many failures"));
    assert!(!s1.borrow().up());
    assert!(s1.borrow().status().contains("susp"));
    assert!(s1.borrow().status().contains("fail3"));

    // revival probe at suspension time + revival delay = 3 + 10
    assert_eq!(fx.lp.next_deadline(), Some(secs(13)));

    // the revival probe succeeds and the service comes back
    fx.push(ok_reply(60));
    fx.lp.advance(secs(10));
    assert!(s1.borrow().up());
    assert_eq!(s1.borrow().failure_count(), 0);
    assert!(s1.borrow().suspended_reason().is_none());
}

#[test]
fn negative_failure_limit_disables_suspension() {
    let mut fx = Fixture::new(config(-1, 10, 0));
    fx.push(ok_reply(60));
    fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending();

    for _ in 0..5 {
        fx.lp.note_failure("s1");
    }
    let s1 = fx.lp.service("s1").unwrap();
    assert!(s1.borrow().suspended_reason().is_none());
    assert!(s1.borrow().up());
    assert!(s1.borrow().status().contains("fail5"));
}

#[test]
fn extra_failures_while_suspended_do_not_postpone_revival() {
    let mut fx = Fixture::new(config(0, 50, 0));
    fx.push(ok_reply(60));
    fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending();

    fx.lp.note_failure("s1"); // 1 > 0: suspended at t=0
    let s1 = fx.lp.service("s1").unwrap();
    assert_eq!(s1.borrow().suspended_reason(), Some("too many failures"));
    assert_eq!(fx.lp.next_deadline(), Some(secs(50)));

    fx.lp.advance(secs(5));
    fx.lp.note_failure("s1"); // while suspended: counted, nothing rescheduled
    assert_eq!(s1.borrow().failure_count(), 2);
    assert_eq!(fx.lp.next_deadline(), Some(secs(50)));
}

// =============================================================================
// Probe storm guard
// =============================================================================

#[test]
fn min_gap_defers_refresh_of_quickly_expiring_options() {
    let mut fx = Fixture::new(config(10, 180, 30));
    fx.push(ok_reply(10)); // expires at t=10, before the probe lead
    fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending();

    // raw fetch time would be now, but the minimum gap since the last
    // probe wins: t=30, despite the options going stale at t=10
    assert_eq!(fx.lp.next_deadline(), Some(secs(30)));
}

#[test]
fn consecutive_probes_respect_the_minimum_gap() {
    let mut fx = Fixture::new(config(10, 180, 30));
    fx.push(ok_reply(10));
    fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending();

    fx.push(ok_reply(10));
    fx.lp.advance(secs(30)); // second probe at t=30
    let s1 = fx.lp.service("s1").unwrap();
    assert!(s1.borrow().up());
    // and the third is again gap-clamped: 30 + 30
    assert_eq!(fx.lp.next_deadline(), Some(secs(60)));
}

#[test]
fn options_expiring_within_the_probe_lead_refetch_immediately() {
    let mut fx = Fixture::new(config(10, 180, 0));
    fx.push(ok_reply(10)); // expires before one probe duration passes
    let s1 = fx.add_icap("s1");
    let seen = fx.watch("s1", "W1");
    fx.lp.run_pending();

    // with no gap to wait out, the refetch ran immediately, found nobody
    // home, and the next attempt waits out the revival delay
    assert!(s1.borrow().broken());
    assert_eq!(fx.lp.next_deadline(), Some(secs(180)));
    assert_eq!(seen.borrow().len(), 1, "waiter still fired exactly once");
}

#[test]
fn zero_revival_delay_is_still_clamped_by_the_minimum_gap() {
    let mut fx = Fixture::new(config(0, 0, 30));
    fx.push(ok_reply(60));
    fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending();

    fx.lp.note_failure("s1"); // limit 0: suspended on the first failure
    let s1 = fx.lp.service("s1").unwrap();
    assert_eq!(s1.borrow().suspended_reason(), Some("too many failures"));
    assert_eq!(fx.lp.next_deadline(), Some(secs(30)));
}

// =============================================================================
// Waiter queue semantics
// =============================================================================

#[test]
fn waiters_fire_in_registration_order() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ok_reply(60));
    fx.add_icap("s1");

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    for label in ["W1", "W2", "W3"] {
        let sink = Rc::clone(&order);
        let target = fx.lp.register_target(label);
        fx.lp.call_when_ready(
            "s1",
            target,
            Box::new(move |_ctx: &mut Ctx, _service: ServicePointer| sink.borrow_mut().push(label)),
        );
    }
    fx.lp.run_pending();
    assert_eq!(*order.borrow(), ["W1", "W2", "W3"]);
}

#[test]
fn waiter_added_during_notification_is_drained_in_the_same_run() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ok_reply(60));
    fx.add_icap("s1");

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let first_target = fx.lp.register_target("W1");
    let second_target = fx.lp.register_target("W2");
    let sink = Rc::clone(&order);
    fx.lp.call_when_ready(
        "s1",
        first_target,
        Box::new(move |ctx: &mut Ctx, service: ServicePointer| {
            sink.borrow_mut().push("first");
            let inner = Rc::clone(&sink);
            ServiceRep::call_when_ready(
                &service,
                ctx,
                Box::new(move |_ctx: &mut Ctx, _service: ServicePointer| inner.borrow_mut().push("second")),
                second_target,
            );
        }),
    );

    fx.lp.run_pending();
    assert_eq!(*order.borrow(), ["first", "second"]);
}

#[test]
fn waiter_with_dead_target_is_silently_dropped() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ok_reply(60));
    fx.add_icap("s1");

    let seen = Rc::new(RefCell::new(Vec::<Observation>::new()));
    let sink = Rc::clone(&seen);
    let target = fx.lp.register_target("doomed");
    fx.lp.call_when_ready(
        "s1",
        target,
        Box::new(move |_ctx: &mut Ctx, service: ServicePointer| {
            let s = service.borrow();
            sink.borrow_mut().push(Observation {
                up: s.up(),
                gone: !s.is_configured(),
                status: s.status(),
            });
        }),
    );

    fx.lp.release_target(target); // transaction dies before notification
    fx.lp.run_pending();

    assert!(seen.borrow().is_empty());
    assert!(fx.lp.service("s1").unwrap().borrow().up());
}

#[test]
#[should_panic(expected = "broken service")]
fn waiting_for_a_broken_service_is_a_programmer_error() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.push(ProbePlan::Unreachable);
    fx.add_icap("s1");
    fx.watch("s1", "W1");
    fx.lp.run_pending(); // probe fails: service is now broken

    fx.watch("s1", "W2");
}

// =============================================================================
// Invalidation and reconfiguration
// =============================================================================

#[test]
fn invalidation_still_notifies_pending_waiters() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    fx.add_icap("s1");
    let w1 = fx.watch("s1", "W1");
    let w2 = fx.watch("s1", "W2");
    let w3 = fx.watch("s1", "W3");

    // the probe has not run yet; reconfigure the service away first
    fx.lp.reconfigure(AdaptationConfig::default(), vec![]);
    fx.lp.run_pending();

    for seen in [&w1, &w2, &w3] {
        let obs = seen.borrow();
        assert_eq!(obs.len(), 1, "every waiter fired exactly once");
        assert!(obs[0].gone, "callback observed the deconfigured service");
        assert!(!obs[0].up);
        assert!(obs[0].status.contains("gone"));
    }
}

#[test]
fn reconfigure_installs_the_new_service_set() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    let old = fx.add_icap("s1");

    let replacement = parse_service_line("s2 respmod_precache 1 icap://other:1344/av").unwrap();
    fx.lp.reconfigure(AdaptationConfig::default(), vec![replacement]);

    assert!(fx.lp.service("s1").is_none());
    assert!(fx.lp.service("s2").is_some());
    assert!(!old.borrow().is_configured());
    assert!(old.borrow().status().contains("gone"));
}

#[test]
fn invalidate_is_idempotent() {
    let mut timer = EventTimer::new();
    let config = AdaptationConfig::default();
    let targets: HandleTable<String> = HandleTable::new();

    let info = parse_service_line("s1 reqmod_precache 0 icap://h:1344/r").unwrap();
    let rc: ServicePointer = Rc::new(RefCell::new(ServiceRep::new(
        info,
        TargetId(1),
        timer.clock(),
    )));
    ServiceRep::configure(&rc);

    let mut ctx = Ctx {
        timer: &mut timer,
        config: &config,
        targets: &targets,
    };
    ServiceRep::invalidate(&rc, &mut ctx);
    assert!(!rc.borrow().is_configured());
    ServiceRep::invalidate(&rc, &mut ctx); // second call: no further effect
    assert!(!rc.borrow().is_configured());
}

#[test]
fn call_when_ready_for_unknown_identity_returns_false() {
    let mut fx = Fixture::new(AdaptationConfig::default());
    let target = fx.lp.register_target("W1");
    let called = fx
        .lp
        .call_when_ready("nope", target, Box::new(|_ctx: &mut Ctx, _service: ServicePointer| {}));
    assert!(!called);
}

// =============================================================================
// Warnings and announcements
// =============================================================================

#[test]
fn method_mismatch_warns_but_installs_options() {
    let ((), logs) = with_captured_logs(|| {
        let mut fx = Fixture::new(AdaptationConfig::default());
        fx.push(ProbePlan::Respond(Reply {
            ttl: 60,
            methods: vec![Method::Respmod],
            ..Reply::default()
        }));
        let s1 = fx.add_icap("s1"); // configured for REQMOD
        let seen = fx.watch("s1", "W1");
        fx.lp.run_pending();

        assert!(s1.borrow().up(), "mismatched options are still installed");
        assert!(seen.borrow()[0].up);
    });
    assert!(
        logs.contains("OPTIONS response declares the methods are RESPMOD"),
        "missing method mismatch warning in:\n{logs}"
    );
}

#[test]
fn clock_skew_beyond_ttl_warns_but_keeps_options() {
    let ((), logs) = with_captured_logs(|| {
        let mut fx = Fixture::new(AdaptationConfig::default());
        fx.push(ProbePlan::Respond(Reply {
            ttl: 60,
            methods: vec![Method::Reqmod],
            skew: 100,
            ..Reply::default()
        }));
        let s1 = fx.add_icap("s1");
        fx.watch("s1", "W1");
        fx.lp.run_pending();
        assert!(s1.borrow().up(), "skewed options remain usable");
    });
    assert!(
        logs.contains("clock is skewed by 100s"),
        "missing skew warning in:\n{logs}"
    );
}

#[test]
fn availability_announcements_fire_once_per_transition() {
    let ((), logs_by_stage) = with_captured_logs(|| {
        let mut fx = Fixture::new(AdaptationConfig::default());
        fx.push(ok_reply(60));
        fx.add_icap("s1");
        fx.watch("s1", "W1");
        fx.lp.run_pending();
        // coming up at startup is not announced

        // refresh at t=40 fails: one "down" announcement
        fx.push(ProbePlan::Unreachable);
        fx.lp.advance(secs(40));

        // next probe at t=220 fails too: still down, no new announcement
        fx.push(ProbePlan::Unreachable);
        fx.lp.advance(secs(180));

        // recovery at t=400: one "up" announcement
        fx.push(ok_reply(60));
        fx.lp.advance(secs(180));
    });
    let downs = logs_by_stage
        .matches("service is down after an options fetch failure")
        .count();
    let ups = logs_by_stage.matches("service is up").count();
    assert_eq!(downs, 1, "exactly one down announcement in:\n{logs_by_stage}");
    assert_eq!(ups, 1, "exactly one up announcement in:\n{logs_by_stage}");
}

// =============================================================================
// The production command loop
// =============================================================================

#[test]
fn command_loop_round_trip() {
    let (tx, rx) = crossbeam::channel::unbounded::<Command>();
    let observed: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

    let worker = std::thread::spawn(move || {
        // Rc-based state must be built on the loop thread
        let mut lp = AdaptationLoop::new(AdaptationConfig::default());
        let plan: Plan = Rc::new(RefCell::new(VecDeque::from([ok_reply(60)])));
        let pending: Pending = Rc::new(RefCell::new(None));
        lp.install_adapter(
            ServiceKind::Icap,
            ProtocolAdapter {
                prober: Box::new(StubProber {
                    plan,
                    pending: Rc::clone(&pending),
                }),
                decoder: Box::new(StubDecoder { pending }),
            },
        );
        lp.add_service(parse_service_line("s1 reqmod_precache 0 icap://h:1344/r").unwrap());
        run_loop(lp, rx);
    });

    let (reply_tx, reply_rx) = crossbeam::channel::unbounded();
    tx.send(Command::RegisterTarget {
        description: "tx1".into(),
        reply: reply_tx,
    })
    .unwrap();
    let target = reply_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("target handle");

    let sink = Arc::clone(&observed);
    tx.send(Command::CallWhenReady {
        service: "s1".into(),
        target,
        callback: Box::new(move |_ctx: &mut Ctx, service: ServicePointer| {
            sink.lock().unwrap().push(service.borrow().up());
        }),
    })
    .unwrap();

    // the loop probes and notifies on its own thread
    for _ in 0..200 {
        if !observed.lock().unwrap().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    tx.send(Command::Shutdown).unwrap();
    worker.join().expect("loop thread");

    assert_eq!(*observed.lock().unwrap(), vec![true]);
}
