use std::fmt::{Debug, Formatter};

use tokio::sync::oneshot;
use tracing::warn;

use crate::status::StatusOr;

/// A single-shot continuation. Invoking it consumes it, so it can run at most once; a callback
///  that is dropped without being invoked is reported, since every operation that accepts a
///  callback promises to resolve it exactly once.
///
/// [Callback::ignored] is the marker for fire-and-forget operations: invoking it does nothing.
pub struct Callback<T> {
    f: Option<Box<dyn FnOnce(T) + Send>>,
    armed: bool,
}

pub type StatusOrCallback<T> = Callback<StatusOr<T>>;

impl<T> Callback<T> {
    pub fn new(f: impl FnOnce(T) + Send + 'static) -> Callback<T> {
        Callback {
            f: Some(Box::new(f)),
            armed: true,
        }
    }

    pub fn ignored() -> Callback<T> {
        Callback {
            f: None,
            armed: false,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.f.is_none()
    }

    pub fn call(mut self, value: T) {
        self.armed = false;
        if let Some(f) = self.f.take() {
            f(value);
        }
    }

    /// Drops the callback without invoking it. This is for callbacks whose cancellation is part
    ///  of their contract, e.g. cancelled timer callbacks.
    pub fn forget(mut self) {
        self.armed = false;
    }
}

impl<T: Send + 'static> Callback<T> {
    /// Bridges the callback style to `async` code: the returned receiver resolves with the value
    ///  the callback is invoked with.
    pub fn channel() -> (Callback<T>, oneshot::Receiver<T>) {
        let (send, recv) = oneshot::channel();
        let callback = Callback::new(move |value| {
            // the receiving side may have lost interest, which is fine
            let _ = send.send(value);
        });
        (callback, recv)
    }
}

impl<T> Drop for Callback<T> {
    fn drop(&mut self) {
        if self.armed {
            warn!("callback dropped without being invoked");
        }
    }
}

impl<T> Debug for Callback<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_ignored() {
            write!(f, "Callback(ignored)")
        }
        else {
            write!(f, "Callback")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use super::*;

    #[test]
    fn test_call_invokes_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb = Callback::new(move |v: u32| seen2.lock().unwrap().push(v));
        assert!(!cb.is_ignored());
        cb.call(5);
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[test]
    fn test_ignored() {
        let cb = Callback::<u32>::ignored();
        assert!(cb.is_ignored());
        cb.call(1);
    }

    #[tokio::test]
    async fn test_channel() {
        let (cb, recv) = Callback::channel();
        cb.call("done");
        assert_eq!(recv.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_channel_dropped_callback_closes_receiver() {
        let (cb, recv) = Callback::<u8>::channel();
        drop(cb);
        assert!(recv.await.is_err());
    }
}
