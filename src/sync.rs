// Copyright 2026 Joyent, Inc.

//! Primitives that decouple the continuous report reader from the request
//! that is waiting for a response.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;

/// Failures produced by the primitives themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    Timeout,
    Reset,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BufferState<T, E> {
    next_waiter: u64,
    waiting: VecDeque<(u64, oneshot::Sender<Result<T, E>>)>,
    available: VecDeque<Result<T, E>>,
}

/// Single consumer queue: a push hands the value to the oldest waiter, or
/// keeps it until somebody takes it.
pub struct ValueBuffer<T, E> {
    state: Mutex<BufferState<T, E>>,
}

impl<T, E> Default for ValueBuffer<T, E> {
    fn default() -> Self {
        ValueBuffer::new()
    }
}

impl<T, E> ValueBuffer<T, E> {
    pub fn new() -> ValueBuffer<T, E> {
        ValueBuffer {
            state: Mutex::new(BufferState {
                next_waiter: 0,
                waiting: VecDeque::new(),
                available: VecDeque::new(),
            }),
        }
    }

    pub fn push(&self, value: T) {
        self.push_result(Ok(value))
    }

    pub fn push_error(&self, error: E) {
        self.push_result(Err(error))
    }

    fn push_result(&self, mut value: Result<T, E>) {
        let mut state = lock(&self.state);
        while let Some((_, tx)) = state.waiting.pop_front() {
            match tx.send(value) {
                Ok(()) => return,
                // the waiter went away between timing out and removing itself
                Err(v) => value = v,
            }
        }
        state.available.push_back(value);
    }

    pub fn len(&self) -> usize {
        lock(&self.state).available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn waiters(&self) -> usize {
        lock(&self.state).waiting.len()
    }

    fn remove_waiter(&self, id: u64) {
        lock(&self.state).waiting.retain(|(wid, _)| *wid != id);
    }
}

impl<T, E: From<BufferError>> ValueBuffer<T, E> {
    /// Take the next value, waiting at most `timeout` for one to be pushed.
    /// `None` waits until a value arrives or the buffer is drained.
    pub async fn take(&self, timeout: Option<Duration>) -> Result<T, E> {
        let (id, rx) = {
            let mut state = lock(&self.state);
            if let Some(v) = state.available.pop_front() {
                return v;
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back((id, tx));
            (id, rx)
        };

        let received = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(r) => r,
                Err(_) => {
                    self.remove_waiter(id);
                    return Err(E::from(BufferError::Timeout));
                }
            },
            None => rx.await,
        };

        match received {
            Ok(v) => v,
            Err(oneshot::Canceled) => Err(E::from(BufferError::Reset)),
        }
    }

    /// Reject every pending waiter and forget buffered values.
    pub fn drain(&self) {
        let mut state = lock(&self.state);
        for (_, tx) in state.waiting.drain(..) {
            let _ = tx.send(Err(E::from(BufferError::Reset)));
        }
        state.available.clear();
    }
}

/// Keyed mutual exclusion: at most one operation per key runs at a time and
/// later operations on the same key run in the order they were enqueued,
/// whether the earlier ones succeeded or failed.
pub struct OperationSerializer<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for OperationSerializer<K> {
    fn default() -> Self {
        OperationSerializer::new()
    }
}

impl<K: Eq + Hash + Clone> OperationSerializer<K> {
    pub fn new() -> OperationSerializer<K> {
        OperationSerializer {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn enqueue<F, T>(&self, key: K, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = {
            let mut locks = lock(&self.locks);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let result = {
            // tokio's mutex hands the lock out in FIFO order
            let _guard = slot.lock().await;
            operation.await
        };

        let mut locks = lock(&self.locks);
        // our clone plus the one in the map: nobody else is queued
        if Arc::strong_count(&slot) == 2 {
            locks.remove(&key);
        }
        result
    }

    /// Keys with an operation running or queued.
    pub fn active_keys(&self) -> usize {
        lock(&self.locks).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    type Buffer = ValueBuffer<u32, BufferError>;

    #[tokio::test]
    async fn buffered_value_is_returned_immediately() {
        let buf = Buffer::new();
        buf.push(1);
        buf.push(2);
        assert_eq!(buf.take(Some(Duration::from_millis(10))).await, Ok(1));
        assert_eq!(buf.take(None).await, Ok(2));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn push_satisfies_oldest_waiter() {
        let buf = Arc::new(Buffer::new());
        let b1 = Arc::clone(&buf);
        let first = tokio::spawn(async move { b1.take(None).await });
        tokio::task::yield_now().await;
        let b2 = Arc::clone(&buf);
        let second = tokio::spawn(async move { b2.take(None).await });
        while buf.waiters() < 2 {
            tokio::task::yield_now().await;
        }
        buf.push(10);
        buf.push(20);
        assert_eq!(first.await.unwrap(), Ok(10));
        assert_eq!(second.await.unwrap(), Ok(20));
    }

    #[tokio::test]
    async fn timeout_removes_waiter() {
        let buf = Buffer::new();
        let res = buf.take(Some(Duration::from_millis(5))).await;
        assert_eq!(res, Err(BufferError::Timeout));
        assert_eq!(buf.waiters(), 0);
        // next push is buffered, not lost to the dead waiter
        buf.push(3);
        assert_eq!(buf.len(), 1);
    }

    #[tokio::test]
    async fn errors_are_delivered() {
        let buf = Buffer::new();
        buf.push_error(BufferError::Reset);
        assert_eq!(buf.take(None).await, Err(BufferError::Reset));
    }

    #[tokio::test]
    async fn drain_rejects_waiters() {
        let buf = Arc::new(Buffer::new());
        let b1 = Arc::clone(&buf);
        let waiter = tokio::spawn(async move { b1.take(None).await });
        while buf.waiters() < 1 {
            tokio::task::yield_now().await;
        }
        buf.drain();
        assert_eq!(waiter.await.unwrap(), Err(BufferError::Reset));
    }

    #[tokio::test]
    async fn serializer_runs_one_at_a_time_in_order() {
        let ser = Arc::new(OperationSerializer::new());
        let running = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5u32 {
            let ser = Arc::clone(&ser);
            let running = Arc::clone(&running);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                ser.enqueue("talk", async move {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    lock(&order).push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                    if i % 2 == 0 {
                        Err(i)
                    } else {
                        Ok(i)
                    }
                })
                .await
            }));
            // let each task queue up before spawning the next
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for (i, h) in handles.into_iter().enumerate() {
            let res = h.await.unwrap();
            assert_eq!(res.is_ok(), i % 2 == 1);
        }
        assert_eq!(*lock(&order), vec![0, 1, 2, 3, 4]);
        assert_eq!(ser.active_keys(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let ser = OperationSerializer::new();
        let (a, b) = tokio::join!(
            ser.enqueue("a", async { 1 }),
            ser.enqueue("b", async { 2 })
        );
        assert_eq!((a, b), (1, 2));
    }
}
