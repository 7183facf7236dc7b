//! Throttled buffer allocation
//!
//! Record buffers are accounted in 4 KiB extents against a fixed memory
//! budget. An allocation that does not fit waits until earlier buffers are
//! released, which throttles writers while flushes are outstanding.

use overlog_common::{EXTENT_SIZE, Error, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// External signal that the engine should flush early
pub trait PressureSource: Send + Sync {
    fn under_pressure(&self) -> bool;
}

/// Extents held by one buffer; returned to the budget on drop
#[derive(Debug)]
pub struct Allocation {
    _permit: OwnedSemaphorePermit,
    extents: u32,
}

impl Allocation {
    #[must_use]
    pub const fn extents(&self) -> u32 {
        self.extents
    }

    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.extents as u64 * EXTENT_SIZE
    }
}

/// Extent allocator over a bounded memory budget
pub struct ThrottledAllocator {
    permits: Arc<Semaphore>,
    total_extents: u32,
    pressure_extents: u32,
    pressure_source: Option<Arc<dyn PressureSource>>,
}

impl ThrottledAllocator {
    /// Budget of `memory_limit` bytes; pressure starts at `pressure_percent` of it
    pub fn new(memory_limit: u64, pressure_percent: u8) -> Result<Self> {
        let total_extents = u32::try_from(memory_limit / EXTENT_SIZE)
            .map_err(|_| Error::configuration(format!("memory_limit {memory_limit} is too large")))?;
        if total_extents == 0 {
            return Err(Error::configuration(
                "memory_limit must hold at least one extent",
            ));
        }
        let pressure_extents =
            u32::try_from(u64::from(total_extents) * u64::from(pressure_percent.min(100)) / 100)
                .unwrap_or(total_extents);

        Ok(Self {
            permits: Arc::new(Semaphore::new(total_extents as usize)),
            total_extents,
            pressure_extents,
            pressure_source: None,
        })
    }

    #[must_use]
    pub fn with_pressure_source(mut self, source: Arc<dyn PressureSource>) -> Self {
        self.pressure_source = Some(source);
        self
    }

    /// Allocate enough extents for `bytes`, waiting for budget if needed
    pub async fn allocate(&self, bytes: u64) -> Result<Allocation> {
        let extents = u32::try_from(bytes.div_ceil(EXTENT_SIZE))
            .map_err(|_| Error::resource_exhausted(format!("allocation of {bytes} bytes")))?;
        if extents > self.total_extents {
            return Err(Error::resource_exhausted(format!(
                "allocation of {} bytes exceeds memory limit of {} bytes",
                bytes,
                u64::from(self.total_extents) * EXTENT_SIZE
            )));
        }

        let permit = Arc::clone(&self.permits)
            .acquire_many_owned(extents)
            .await
            .map_err(|_| Error::shutdown_pending("buffer allocator closed"))?;
        Ok(Allocation {
            _permit: permit,
            extents,
        })
    }

    #[must_use]
    pub fn extents_in_use(&self) -> u32 {
        let available = u32::try_from(self.permits.available_permits()).unwrap_or(u32::MAX);
        self.total_extents.saturating_sub(available)
    }

    #[must_use]
    pub fn bytes_in_use(&self) -> u64 {
        u64::from(self.extents_in_use()) * EXTENT_SIZE
    }

    /// Budget use has crossed the pressure threshold, or the external
    /// source reports pressure
    #[must_use]
    pub fn is_under_pressure(&self) -> bool {
        self.extents_in_use() >= self.pressure_extents
            || self
                .pressure_source
                .as_ref()
                .is_some_and(|source| source.under_pressure())
    }

    /// Fail current and future waiters
    pub fn close(&self) {
        self.permits.close();
    }
}
