//! Process-role facade over the shared page pool.
//!
//! The master process sizes and formats the pool; workers attach to it;
//! in single-process mode no pool exists and callers fall back to private
//! allocation. The pool also never exists when the configured memory
//! limit is zero or smaller than a single page.

use std::path::Path;

use tracing::{debug, warn};

use crate::config::SharedMemConfig;

use super::page_pool::{PageId, PagePool, PoolError, PoolOwner};

const POOL_FILE: &str = "remora-page-pool";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Master,
    Worker,
}

pub struct SharedMemPages {
    pool: Option<PagePool>,
    owner: Option<PoolOwner>,
    limit: u64,
    page_size: u32,
}

impl SharedMemPages {
    /// Set up shared pages for this process. Masters initialize the pool,
    /// workers attach to it. Returns a disabled facade (every `get_page`
    /// is None) outside SMP mode or when the limit is too small for even
    /// one page.
    pub fn new(
        config: &SharedMemConfig,
        role: ProcessRole,
        dir: &Path,
    ) -> Result<SharedMemPages, PoolError> {
        let disabled = SharedMemPages {
            pool: None,
            owner: None,
            limit: config.memory_limit,
            page_size: config.page_size,
        };

        if !config.smp() {
            debug!(target: "ipc", "single process mode, shared pages disabled");
            return Ok(disabled);
        }
        if config.memory_limit == 0 {
            debug!(target: "ipc", "no shared memory configured");
            return Ok(disabled);
        }
        if config.memory_limit < u64::from(config.page_size) {
            if role == ProcessRole::Master {
                warn!(
                    target: "ipc",
                    "WARNING: shared memory limit is too small ({:.1} KB), should be >= {:.1} KB",
                    config.memory_limit as f64 / 1024.0,
                    f64::from(config.page_size) / 1024.0
                );
            }
            return Ok(disabled);
        }

        let path = dir.join(POOL_FILE);
        let (owner, pool) = match role {
            ProcessRole::Master => {
                let capacity = (config.memory_limit / u64::from(config.page_size)) as u32;
                let owner = PoolOwner::init(&path, capacity, config.page_size)?;
                let pool = PagePool::attach(&path)?;
                debug!(
                    target: "ipc",
                    "initialized shared page pool: {} pages of {} bytes",
                    capacity,
                    config.page_size
                );
                (Some(owner), Some(pool))
            }
            ProcessRole::Worker => (None, Some(PagePool::attach(&path)?)),
        };

        Ok(SharedMemPages {
            pool,
            owner,
            limit: config.memory_limit,
            page_size: config.page_size,
        })
    }

    pub fn enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Configured shared memory budget, in bytes.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes currently checked out across all processes.
    pub fn level(&self) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        match pool.size() {
            Ok(free) => u64::from(pool.capacity() - free) * u64::from(self.page_size),
            Err(e) => {
                warn!(target: "ipc", "cannot read page pool level: {e}");
                0
            }
        }
    }

    /// A page for an in-flight object, or None when no pool exists or it
    /// is exhausted; callers then use their private allocation path.
    pub fn get_page(&mut self) -> Option<PageId> {
        let pool = self.pool.as_mut()?;
        match pool.get() {
            Ok(page) => page,
            Err(e) => {
                warn!(target: "ipc", "page pool get failed: {e}");
                None
            }
        }
    }

    /// Return a page obtained from `get_page`. Calling this without a pool
    /// is a programmer error: nothing could have handed out the page.
    pub fn put_page(&mut self, page: PageId) {
        let pool = self
            .pool
            .as_mut()
            .expect("returning a page but no page pool exists");
        if let Err(e) = pool.put(page) {
            warn!(target: "ipc", "page pool put failed: {e}");
        }
    }

    pub fn read_page(&self, page: PageId, buf: &mut [u8]) -> Result<(), PoolError> {
        let pool = self.pool.as_ref().expect("reading a page but no page pool exists");
        pool.read_page(page, buf)
    }

    pub fn write_page(&self, page: PageId, data: &[u8]) -> Result<(), PoolError> {
        let pool = self.pool.as_ref().expect("writing a page but no page pool exists");
        pool.write_page(page, data)
    }

    /// Orderly teardown: detach, and (for the master) destroy the pool.
    /// Destruction requires every worker to have detached already.
    pub fn shutdown(mut self) -> Result<(), PoolError> {
        if let Some(mut pool) = self.pool.take() {
            pool.detach()?;
        }
        if let Some(mut owner) = self.owner.take() {
            owner.destroy()?;
        }
        Ok(())
    }
}
