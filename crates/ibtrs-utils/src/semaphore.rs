use std::sync::Arc;

use tokio::sync::{Semaphore as TokioSemaphore, TryAcquireError};

/// Why a permit could not be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("no permits available")]
    NoPermits,
    #[error("semaphore closed")]
    Closed,
}

/// A counting semaphore wrapping tokio's Semaphore.
///
/// Permits are detached on acquire: the holder gives them back explicitly
/// with [`Semaphore::release`]. Closing wakes every waiter with
/// [`AcquireError::Closed`].
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<TokioSemaphore>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(TokioSemaphore::new(permits)),
        }
    }

    /// Wait for a permit.
    pub async fn acquire(&self) -> Result<(), AcquireError> {
        let permit = self.inner.acquire().await.map_err(|_| AcquireError::Closed)?;
        permit.forget();
        Ok(())
    }

    pub fn try_acquire(&self) -> Result<(), AcquireError> {
        match self.inner.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(AcquireError::NoPermits),
            Err(TryAcquireError::Closed) => Err(AcquireError::Closed),
        }
    }

    /// Return `n` permits previously taken with `acquire`/`try_acquire`.
    pub fn release(&self, n: usize) {
        self.inner.add_permits(n);
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }
}
