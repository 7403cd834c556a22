//! Integration tests for the shared page pool across process roles.

use std::io;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use remora::{PoolError, ProcessRole, SharedMemConfig, SharedMemPages};

fn smp_config(memory_limit: u64, page_size: u32) -> SharedMemConfig {
    SharedMemConfig {
        memory_limit,
        page_size,
        workers: 4,
    }
}

// =============================================================================
// Log capture
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
// Pool creation policy
// =============================================================================

#[test]
fn single_process_mode_creates_no_pool() {
    let dir = TempDir::new().unwrap();
    let config = SharedMemConfig {
        workers: 1,
        ..SharedMemConfig::default()
    };
    let mut pages = SharedMemPages::new(&config, ProcessRole::Master, dir.path()).unwrap();

    assert!(!pages.enabled());
    assert!(pages.get_page().is_none());
    assert_eq!(pages.level(), 0);
    assert!(!dir.path().join("remora-page-pool").exists());
}

#[test]
fn limit_smaller_than_a_page_warns_and_disables_the_pool() {
    let dir = TempDir::new().unwrap();
    // half a page
    let config = smp_config(16_384, 32_768);

    let (mut pages, logs) = with_captured_logs(|| {
        SharedMemPages::new(&config, ProcessRole::Master, dir.path()).unwrap()
    });
    assert!(logs.contains("shared memory limit is too small"), "{logs}");

    assert!(!pages.enabled());
    assert!(pages.get_page().is_none());

    // workers stay quiet about it
    let ((), worker_logs) = with_captured_logs(|| {
        let mut worker = SharedMemPages::new(&config, ProcessRole::Worker, dir.path()).unwrap();
        assert!(worker.get_page().is_none());
    });
    assert!(!worker_logs.contains("too small"), "{worker_logs}");
}

#[test]
fn zero_limit_disables_the_pool() {
    let dir = TempDir::new().unwrap();
    let mut pages =
        SharedMemPages::new(&smp_config(0, 4096), ProcessRole::Master, dir.path()).unwrap();
    assert!(!pages.enabled());
    assert!(pages.get_page().is_none());
}

// =============================================================================
// Master/worker lifecycle
// =============================================================================

#[test]
fn master_initializes_and_workers_share_pages() {
    let dir = TempDir::new().unwrap();
    let config = smp_config(8 * 4096, 4096);

    let master = SharedMemPages::new(&config, ProcessRole::Master, dir.path()).unwrap();
    assert!(master.enabled());
    assert_eq!(master.limit(), 8 * 4096);
    assert_eq!(master.level(), 0);

    let mut worker = SharedMemPages::new(&config, ProcessRole::Worker, dir.path()).unwrap();
    let page = worker.get_page().expect("a free page");

    // the checkout is visible to the master
    assert_eq!(master.level(), 4096);

    worker.write_page(page, b"in-flight body").unwrap();
    let mut buf = [0u8; 14];
    master.read_page(page, &mut buf).unwrap();
    assert_eq!(&buf, b"in-flight body");

    worker.put_page(page);
    assert_eq!(master.level(), 0);

    worker.shutdown().unwrap();
    master.shutdown().unwrap();
    assert!(!dir.path().join("remora-page-pool").exists());
}

#[test]
fn exhausted_pool_hands_out_nothing_until_a_put() {
    let dir = TempDir::new().unwrap();
    let config = smp_config(2 * 4096, 4096);
    let mut master = SharedMemPages::new(&config, ProcessRole::Master, dir.path()).unwrap();

    let a = master.get_page().expect("page");
    let _b = master.get_page().expect("page");
    assert!(master.get_page().is_none(), "capacity is a hard bound");
    assert_eq!(master.level(), 2 * 4096);

    master.put_page(a);
    assert!(master.get_page().is_some());
}

#[test]
fn master_shutdown_fails_while_a_worker_is_attached() {
    let dir = TempDir::new().unwrap();
    let config = smp_config(4 * 4096, 4096);
    let master = SharedMemPages::new(&config, ProcessRole::Master, dir.path()).unwrap();
    let worker = SharedMemPages::new(&config, ProcessRole::Worker, dir.path()).unwrap();

    assert!(matches!(
        master.shutdown(),
        Err(PoolError::Busy { attached: 1, .. })
    ));

    worker.shutdown().unwrap();
}

#[test]
#[should_panic(expected = "no page pool exists")]
fn returning_a_page_without_a_pool_is_a_programmer_error() {
    let dir = TempDir::new().unwrap();
    let config = SharedMemConfig {
        workers: 1,
        ..SharedMemConfig::default()
    };
    let mut pages = SharedMemPages::new(&config, ProcessRole::Master, dir.path()).unwrap();
    pages.put_page(remora::PageId { pool: 0, number: 0 });
}
