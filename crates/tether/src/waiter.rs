use tokio::sync::oneshot;

use crate::WaiterError;

/// Holds at most one suspended caller and resolves it exactly once.
pub struct SingleSlotWaiter<T, E> {
    slot: Option<oneshot::Sender<Result<T, E>>>,
}

impl<T, E> SingleSlotWaiter<T, E> {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Creates a filled slot along with the receiving half the caller awaits.
    pub fn pair() -> (Self, oneshot::Receiver<Result<T, E>>) {
        let (tx, rx) = oneshot::channel();
        (Self { slot: Some(tx) }, rx)
    }

    pub fn set(&mut self, sender: oneshot::Sender<Result<T, E>>) -> Result<(), WaiterError> {
        if self.slot.is_some() {
            return Err(WaiterError::AlreadySet);
        }
        self.slot = Some(sender);
        Ok(())
    }

    /// Resumes and clears the stored waiter.
    ///
    /// Succeeds even when the caller has already stopped listening; the
    /// result is then discarded.
    pub fn resume(&mut self, result: Result<T, E>) -> Result<(), WaiterError> {
        let Some(sender) = self.slot.take() else {
            return Err(WaiterError::NotFound);
        };
        if sender.send(result).is_err() {
            tracing::trace!("waiter resumed after its caller went away");
        }
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }
}

impl<T, E> Default for SingleSlotWaiter<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_delivers_once_then_reports_not_found() {
        let (mut waiter, mut rx) = SingleSlotWaiter::<u8, ()>::pair();

        assert_eq!(waiter.resume(Ok(7)), Ok(()));
        assert_eq!(rx.try_recv(), Ok(Ok(7)));
        assert!(!waiter.is_set());
        assert_eq!(waiter.resume(Ok(8)), Err(WaiterError::NotFound));
    }

    #[test]
    fn set_rejects_second_waiter() {
        let mut waiter = SingleSlotWaiter::<u8, ()>::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        assert_eq!(waiter.set(tx1), Ok(()));
        assert_eq!(waiter.set(tx2), Err(WaiterError::AlreadySet));
    }

    #[test]
    fn resume_on_empty_slot_is_not_found() {
        let mut waiter = SingleSlotWaiter::<u8, ()>::default();
        assert_eq!(waiter.resume(Err(())), Err(WaiterError::NotFound));
    }

    #[test]
    fn resume_after_caller_dropped_still_clears_slot() {
        let (mut waiter, rx) = SingleSlotWaiter::<u8, ()>::pair();
        drop(rx);

        assert_eq!(waiter.resume(Ok(1)), Ok(()));
        assert!(!waiter.is_set());
    }
}
