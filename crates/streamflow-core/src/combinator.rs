//! Input combinators: [`DotProductCombinator`] and
//! [`CartesianProductCombinator`], synchronising N asynchronous port streams
//! into ordered job firings.
//!
//! Grounded in `streamflow/workflow/combinator.py`. The open question noted
//! in spec §9 — the source's `DotProductInputCombinator.get` wraps its logic
//! in a `while True: ... return; break` that can never reach `break` — is
//! resolved here as straight-line code: each call to `get` returns one
//! firing, or the terminal firing forever after termination.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::port::Port;
use crate::token::check_termination;
use crate::token::PortItem;
use crate::token::TerminationToken;

/// Synchronises N asynchronous input [`Port`]s into job firings.
///
/// Implementors own a port-name-ordered map; every firing they return has
/// one entry per port, in the map's insertion order.
#[async_trait]
pub trait InputCombinator<V>: Send {
    /// The combinator's own name, used to tag its terminal firing.
    fn name(&self) -> &str;

    /// Produces the next firing.
    ///
    /// Returns a non-terminal list of length equal to the number of input
    /// ports on every call until the combinator has observed termination on
    /// every port, at which point it returns a singleton list containing one
    /// [`PortItem::Termination`] and every subsequent call does the same.
    async fn get(&mut self) -> Vec<PortItem<V>>;
}

/// Merges N ports under element-wise product semantics: the k-th firing
/// pairs the k-th token from every port.
///
/// Terminates as soon as every port reports termination on the same read,
/// emitting exactly one terminal firing.
pub struct DotProductCombinator<V> {
    /// The combinator's name, used to tag its terminal firing.
    name: Arc<str>,
    /// Input ports, insertion-ordered.
    ports: IndexMap<Arc<str>, Port<V>>,
    /// Set once every port has terminated; further `get()` calls short
    /// circuit to the terminal firing without touching the ports again.
    terminated: bool,
}

impl<V: Clone + Send + 'static> DotProductCombinator<V> {
    /// Constructs a combinator over the given ports, in the iteration order
    /// of `ports`.
    pub fn new(name: impl Into<Arc<str>>, ports: IndexMap<Arc<str>, Port<V>>) -> Self {
        Self {
            name: name.into(),
            ports,
            terminated: false,
        }
    }

    fn terminal_firing(&self) -> Vec<PortItem<V>> {
        vec![PortItem::Termination(TerminationToken::new(Arc::clone(
            &self.name,
        )))]
    }
}

#[async_trait]
impl<V: Clone + Send + 'static> InputCombinator<V> for DotProductCombinator<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&mut self) -> Vec<PortItem<V>> {
        if self.terminated {
            return self.terminal_firing();
        }

        let reads = futures::future::join_all(self.ports.values().map(|port| port.get())).await;

        if check_termination(&reads) {
            self.terminated = true;
            return self.terminal_firing();
        }

        reads
    }
}

/// Merges N ports under Cartesian-product semantics: every new token
/// arriving on any still-open port is combined with the latest token seen
/// so far on every other port.
///
/// Grounded in `CartesianProductInputCombinator` / `_cartesian_multiplier`:
/// a background task keeps reading each port and pushes every new
/// combination into a FIFO queue that `get()` drains.
pub struct CartesianProductCombinator<V> {
    /// The combinator's name, used to tag its terminal firing.
    name: Arc<str>,
    /// Input ports, insertion-ordered; consumed (via cloned handles) by
    /// [`initialize`] and the background multiplier.
    ports: IndexMap<Arc<str>, Port<V>>,
    /// Lazily initialised state.
    state: State<V>,
}

/// The lifecycle state of a [`CartesianProductCombinator`].
enum State<V> {
    /// `get()` has not yet been called.
    Uninitialized,
    /// The background multiplier is running; firings arrive on this
    /// receiver.
    Running(mpsc::UnboundedReceiver<Vec<PortItem<V>>>),
    /// The terminal firing has already been produced.
    Terminated,
}

impl<V: Clone + Send + 'static> CartesianProductCombinator<V> {
    /// Constructs a combinator over the given ports, in the iteration order
    /// of `ports`.
    pub fn new(name: impl Into<Arc<str>>, ports: IndexMap<Arc<str>, Port<V>>) -> Self {
        Self {
            name: name.into(),
            ports,
            state: State::Uninitialized,
        }
    }

    fn terminal_firing(&self) -> Vec<PortItem<V>> {
        vec![PortItem::Termination(TerminationToken::new(Arc::clone(
            &self.name,
        )))]
    }

    /// Reads one token from every port; either resolves immediately to
    /// termination, or seeds the initial firing, spawns the multiplier, and
    /// switches to [`State::Running`].
    async fn initialize(&mut self) {
        let names: Vec<Arc<str>> = self.ports.keys().cloned().collect();
        let reads =
            futures::future::join_all(self.ports.values().map(|port| port.get())).await;

        if check_termination(&reads) {
            self.state = State::Terminated;
            return;
        }

        let mut token_lists: IndexMap<Arc<str>, Vec<PortItem<V>>> = IndexMap::new();
        for (name, item) in names.iter().zip(reads.iter()) {
            token_lists.insert(name.clone(), vec![item.clone()]);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // Seed the initial vector before the multiplier starts so it is
        // always the first firing observed by `get()`.
        let _ = tx.send(reads);

        let ports = self.ports.clone();
        let combinator_name = Arc::clone(&self.name);
        tokio::spawn(multiplier(combinator_name, ports, token_lists, tx));

        self.state = State::Running(rx);
    }
}

/// One outstanding read, tagged with the port name it came from.
type NamedRead<V> = Pin<Box<dyn Future<Output = (Arc<str>, PortItem<V>)> + Send>>;

fn named_read<V: Clone + Send + 'static>(name: Arc<str>, port: Port<V>) -> NamedRead<V> {
    Box::pin(async move {
        let item = port.get().await;
        (name, item)
    })
}

/// The background task that keeps reading every still-open port and
/// enqueues every new Cartesian combination.
async fn multiplier<V: Clone + Send + 'static>(
    combinator_name: Arc<str>,
    ports: IndexMap<Arc<str>, Port<V>>,
    mut token_lists: IndexMap<Arc<str>, Vec<PortItem<V>>>,
    tx: mpsc::UnboundedSender<Vec<PortItem<V>>>,
) {
    let mut terminated: HashSet<Arc<str>> = HashSet::new();
    let mut pending: FuturesUnordered<NamedRead<V>> = FuturesUnordered::new();
    for (name, port) in &ports {
        pending.push(named_read(Arc::clone(name), port.handle()));
    }

    while let Some((name, item)) = pending.next().await {
        if item.is_termination() {
            terminated.insert(Arc::clone(&name));
            if terminated.len() == ports.len() {
                let _ = tx.send(vec![PortItem::Termination(TerminationToken::new(
                    combinator_name,
                ))]);
                return;
            }
            // Do not reissue a read on a terminated port.
            continue;
        }

        for combination in cartesian_pinned(&token_lists, &name, &item) {
            if tx.send(combination).is_err() {
                // The combinator was dropped; stop reading ports.
                return;
            }
        }

        token_lists
            .get_mut(&name)
            .expect("port name present in token_lists")
            .push(item);

        if let Some(port) = ports.get(&name) {
            pending.push(named_read(name, port.handle()));
        }
    }
}

/// Builds the Cartesian product of `[token_lists[Q] for Q != pinned_name] x
/// [pinned_item]`, preserving port insertion order and pinning
/// `pinned_name`'s slot to the singleton `[pinned_item]`.
fn cartesian_pinned<V: Clone>(
    token_lists: &IndexMap<Arc<str>, Vec<PortItem<V>>>,
    pinned_name: &str,
    pinned_item: &PortItem<V>,
) -> Vec<Vec<PortItem<V>>> {
    let mut combinations: Vec<Vec<PortItem<V>>> = vec![Vec::with_capacity(token_lists.len())];
    for (name, list) in token_lists {
        let mut next = Vec::with_capacity(combinations.len());
        if name == pinned_name {
            for combination in &combinations {
                let mut combination = combination.clone();
                combination.push(pinned_item.clone());
                next.push(combination);
            }
        } else {
            for combination in &combinations {
                for item in list {
                    let mut combination = combination.clone();
                    combination.push(item.clone());
                    next.push(combination);
                }
            }
        }
        combinations = next;
    }
    combinations
}

#[async_trait]
impl<V: Clone + Send + 'static> InputCombinator<V> for CartesianProductCombinator<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&mut self) -> Vec<PortItem<V>> {
        if matches!(self.state, State::Uninitialized) {
            self.initialize().await;
        }

        match &mut self.state {
            State::Terminated => self.terminal_firing(),
            State::Running(rx) => match rx.recv().await {
                Some(firing) => {
                    if firing.len() == 1 && firing[0].is_termination() {
                        self.state = State::Terminated;
                        self.terminal_firing()
                    } else {
                        firing
                    }
                }
                None => {
                    self.state = State::Terminated;
                    self.terminal_firing()
                }
            },
            State::Uninitialized => unreachable!("initialize() always leaves Uninitialized"),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::token::Token;

    fn value(item: &PortItem<i32>) -> i32 {
        match item {
            PortItem::Token(token) => token.value,
            PortItem::Termination(_) => panic!("expected a token"),
        }
    }

    fn feed(port: &Port<i32>, name: &str, values: &[i32]) {
        for (i, value) in values.iter().enumerate() {
            port.put(PortItem::Token(Token::new(name, i.to_string(), *value)));
        }
        port.put(PortItem::Termination(TerminationToken::new(name)));
    }

    #[tokio::test]
    async fn dot_product_zips_and_terminates() {
        let a = Port::new();
        let b = Port::new();
        feed(&a, "a", &[1, 2]);
        feed(&b, "b", &[10, 20]);

        let mut ports = IndexMap::new();
        ports.insert(Arc::from("a"), a);
        ports.insert(Arc::from("b"), b);
        let mut combinator = DotProductCombinator::new("combined", ports);

        let firing1 = combinator.get().await;
        assert_eq!(firing1.iter().map(value).collect::<Vec<_>>(), vec![1, 10]);

        let firing2 = combinator.get().await;
        assert_eq!(firing2.iter().map(value).collect::<Vec<_>>(), vec![2, 20]);

        let firing3 = combinator.get().await;
        assert_eq!(firing3.len(), 1);
        assert!(firing3[0].is_termination());

        // Calling again after termination keeps returning the terminal firing.
        let firing4 = combinator.get().await;
        assert!(firing4[0].is_termination());
    }

    #[tokio::test]
    async fn cartesian_product_emits_full_cross_then_terminates() {
        let a = Port::new();
        let b = Port::new();
        feed(&a, "a", &[1, 2]);
        feed(&b, "b", &[10, 20]);

        let mut ports = IndexMap::new();
        ports.insert(Arc::from("a"), a);
        ports.insert(Arc::from("b"), b);
        let mut combinator = CartesianProductCombinator::new("combined", ports);

        let mut firings = Vec::new();
        loop {
            let firing = combinator.get().await;
            if firing.len() == 1 && firing[0].is_termination() {
                break;
            }
            firings.push(firing.iter().map(value).collect::<Vec<_>>());
        }

        assert_eq!(firings[0], vec![1, 10]);
        let set: HashSet<_> = firings.into_iter().collect();
        let expected: HashSet<Vec<i32>> = [
            vec![1, 10],
            vec![1, 20],
            vec![2, 10],
            vec![2, 20],
        ]
        .into_iter()
        .collect();
        assert_eq!(set, expected);
    }
}
