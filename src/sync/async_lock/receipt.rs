/*!
 * Lock Receipts
 *
 * A receipt is the unit of coordination for the async lock: a cloneable
 * future whose completion with `Ok(true)` means "lock granted to this
 * receipt", `Ok(false)` means "request denied", and an error means the
 * request was canceled or torn down. The receipt doubles as the key for
 * release, so holder tracking needs no thread affinity.
 *
 * The waiter state machine lives here as one atomic byte: Pending moves to
 * exactly one of {GrantedTrue, GrantedFalse, Canceled, Disposed} by CAS,
 * and the loser of any race observes the winner's outcome.
 */

use crate::core::errors::AsyncLockError;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Waiter lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ReceiptState {
    Pending = 0,
    GrantedTrue = 1,
    GrantedFalse = 2,
    Canceled = 3,
    Disposed = 4,
}

impl ReceiptState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::GrantedTrue,
            2 => Self::GrantedFalse,
            3 => Self::Canceled,
            _ => Self::Disposed,
        }
    }
}

struct ReceiptInner {
    /// Identity within the owning lock; the holder word stores this
    id: u64,
    state: AtomicU8,
    wakers: Mutex<Vec<Waker>>,
}

/// Handle returned by the async lock's enter operations
///
/// Cloneable; all clones share one outcome. An incomplete receipt returned
/// from an enter operation is always a fresh object, so waiter identity is
/// unambiguous while pending. Completed singletons may be shared when the
/// owning lock reuses receipts.
#[derive(Clone)]
pub struct Receipt {
    inner: Arc<ReceiptInner>,
}

impl Receipt {
    pub(crate) fn pending(id: u64) -> Self {
        Self::with_state(id, ReceiptState::Pending)
    }

    pub(crate) fn completed(id: u64, state: ReceiptState) -> Self {
        debug_assert!(state != ReceiptState::Pending);
        Self::with_state(id, state)
    }

    fn with_state(id: u64, state: ReceiptState) -> Self {
        Self {
            inner: Arc::new(ReceiptInner {
                id,
                state: AtomicU8::new(state as u8),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Move Pending to a terminal state, waking every registered poller.
    ///
    /// Returns false if another transition won; the state is unchanged.
    pub(crate) fn transition(&self, to: ReceiptState) -> bool {
        debug_assert!(to != ReceiptState::Pending);
        if self
            .inner
            .state
            .compare_exchange(
                ReceiptState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let wakers = std::mem::take(&mut *self.inner.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
        true
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state() == ReceiptState::Pending
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        !self.is_pending()
    }

    /// The decided outcome, or `None` while pending
    pub fn outcome(&self) -> Option<Result<bool, AsyncLockError>> {
        match self.state() {
            ReceiptState::Pending => None,
            ReceiptState::GrantedTrue => Some(Ok(true)),
            ReceiptState::GrantedFalse => Some(Ok(false)),
            ReceiptState::Canceled => Some(Err(AsyncLockError::Canceled)),
            ReceiptState::Disposed => Some(Err(AsyncLockError::Disposed)),
        }
    }

    /// Identity comparison: true iff both handles share one receipt
    pub fn same_receipt(&self, other: &Receipt) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> ReceiptState {
        ReceiptState::from_raw(self.inner.state.load(Ordering::Acquire))
    }
}

impl Future for Receipt {
    type Output = Result<bool, AsyncLockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome() {
            return Poll::Ready(outcome);
        }
        let mut wakers = self.inner.wakers.lock();
        // Re-check under the waker lock; a completion that lost the first
        // check must either be visible here or block on the lock until the
        // waker is registered.
        if let Some(outcome) = self.outcome() {
            return Poll::Ready(outcome);
        }
        if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receipt")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_once() {
        let receipt = Receipt::pending(7);
        assert!(receipt.is_pending());
        assert!(receipt.transition(ReceiptState::GrantedTrue));
        assert!(!receipt.transition(ReceiptState::Canceled));
        assert_eq!(receipt.outcome(), Some(Ok(true)));
    }

    #[test]
    fn test_clones_share_outcome() {
        let receipt = Receipt::pending(1);
        let clone = receipt.clone();
        assert!(receipt.same_receipt(&clone));

        receipt.transition(ReceiptState::GrantedFalse);
        assert_eq!(clone.outcome(), Some(Ok(false)));
    }

    #[test]
    fn test_completed_constructors() {
        let granted = Receipt::completed(1, ReceiptState::GrantedTrue);
        assert_eq!(granted.outcome(), Some(Ok(true)));

        let canceled = Receipt::completed(2, ReceiptState::Canceled);
        assert_eq!(canceled.outcome(), Some(Err(AsyncLockError::Canceled)));
    }

    #[test]
    fn test_distinct_receipts_not_same() {
        let a = Receipt::pending(1);
        let b = Receipt::pending(1);
        assert!(!a.same_receipt(&b));
    }

    #[tokio::test]
    async fn test_future_resolves_on_transition() {
        let receipt = Receipt::pending(9);
        let awaited = tokio::spawn(receipt.clone());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(receipt.transition(ReceiptState::GrantedTrue));
        assert_eq!(awaited.await.unwrap(), Ok(true));
    }
}
