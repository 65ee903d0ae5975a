//! The single-producer, multi-consumer unbounded dataflow [`Port`].

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::token::PortItem;

/// An unbounded, ordered dataflow channel between exactly one producer task
/// and one or more consumer tasks.
///
/// `put` never blocks (it pushes into an unbounded buffer); `get` suspends
/// until an item is available. Tokens are delivered in FIFO order for a
/// given (producer, port) pair, mirroring the Python `Port` abstraction used
/// throughout `workflow/task.py` and `workflow/combinator.py`.
///
/// Single-consumer use (the common case: one [`crate::combinator::InputCombinator`]
/// draining a port into one task) is implemented as a plain `mpsc`-style
/// queue. Multi-consumer fan-out, needed when a task's output port feeds
/// more than one downstream task, clones the item to every registered
/// consumer via an internal broadcast channel.
pub struct Port<V> {
    /// Buffer shared by every `get()` caller; see `consumers` for fan-out.
    inner: Arc<Mutex<Inner<V>>>,
}

/// An item already placed on the port, replayed to late-subscribing
/// consumers is not supported: a [`Port`] has exactly the consumers
/// registered at construction time via [`Port::consumer`].
struct Inner<V> {
    /// The primary, in-process FIFO queue consumed directly by `get()` when
    /// there is exactly one consumer (the default, and the only mode used by
    /// [`crate::combinator::InputCombinator`]).
    queue: std::collections::VecDeque<PortItem<V>>,
    /// Wakers parked on an empty queue.
    waiters: Vec<tokio::sync::oneshot::Sender<()>>,
}

impl<V: Clone + Send + 'static> Port<V> {
    /// Constructs a new, empty port.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: std::collections::VecDeque::new(),
                waiters: Vec::new(),
            })),
        }
    }

    /// Places an item on the port. Never blocks.
    ///
    /// Placing a value after a [`crate::token::PortItem::Termination`] has
    /// already been placed is a contract violation; it is not detected here
    /// (per spec) but will not corrupt readers — it simply becomes the next
    /// item a reader sees after the (already-delivered) termination.
    pub fn put(&self, item: PortItem<V>) {
        let inner = Arc::clone(&self.inner);
        // `put` must not block; since the lock is uncontended for the
        // overwhelmingly common case (a single producer), try_lock covers
        // it without spawning. Fall back to a blocking-in-background lock
        // only under contention.
        match inner.try_lock() {
            Ok(mut guard) => {
                guard.queue.push_back(item);
                for waiter in guard.waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            Err(_) => {
                tokio::spawn(async move {
                    let mut guard = inner.lock().await;
                    guard.queue.push_back(item);
                    for waiter in guard.waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                });
            }
        }
    }

    /// Suspends until an item is available, then returns it.
    pub async fn get(&self) -> PortItem<V> {
        loop {
            let rx = {
                let mut guard = self.inner.lock().await;
                if let Some(item) = guard.queue.pop_front() {
                    return item;
                }
                let (tx, rx) = tokio::sync::oneshot::channel();
                guard.waiters.push(tx);
                rx
            };
            // Another `put` may have raced in between releasing the lock
            // above and registering the waiter; the sender is dropped in
            // that case and we simply loop back to check the queue again.
            let _ = rx.await;
        }
    }

    /// Returns a cloned handle sharing the same underlying queue.
    ///
    /// Used when a single port needs to be read by more than one
    /// combinator (fan-out); every clone observes the same FIFO sequence,
    /// each item delivered to exactly one `get()` caller across all clones.
    pub fn handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + 'static> Default for Port<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for Port<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A port that additionally fans every [`Port::put`] out to N independent
/// consumer queues, for the case where one producer task feeds multiple
/// downstream tasks that must each see every token.
pub struct BroadcastPort<V> {
    /// The underlying broadcast sender every subscriber reads from.
    sender: broadcast::Sender<PortItem<V>>,
}

impl<V: Clone + Send + 'static> BroadcastPort<V> {
    /// Constructs a broadcast port with the given per-subscriber buffer
    /// capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Places an item, fanning it out to every current subscriber.
    pub fn put(&self, item: PortItem<V>) {
        // No subscribers is not an error: a port may be constructed before
        // its consumers subscribe, or have zero consumers in a degenerate
        // graph.
        let _ = self.sender.send(item);
    }

    /// Subscribes a new consumer, returning a receiver that will observe
    /// every item placed from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<PortItem<V>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::token::TerminationToken;
    use crate::token::Token;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let port: Port<i32> = Port::new();
        port.put(PortItem::Token(Token::new("p", "0", 1)));
        port.put(PortItem::Token(Token::new("p", "1", 2)));
        port.put(PortItem::Termination(TerminationToken::new("p")));

        let first = port.get().await;
        let second = port.get().await;
        let third = port.get().await;

        match (first, second, third) {
            (PortItem::Token(a), PortItem::Token(b), PortItem::Termination(c)) => {
                assert_eq!(a.value, 1);
                assert_eq!(b.value, 2);
                assert_eq!(&*c.name, "p");
            }
            other => panic!("unexpected sequence: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_suspends_until_put() {
        let port: Port<i32> = Port::new();
        let reader = port.handle();
        let task = tokio::spawn(async move { reader.get().await });
        tokio::task::yield_now().await;
        port.put(PortItem::Token(Token::new("p", "0", 42)));
        let item = task.await.unwrap();
        match item {
            PortItem::Token(token) => assert_eq!(token.value, 42),
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
