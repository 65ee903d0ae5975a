//! The [`Token`] / [`TerminationToken`] dataflow unit.

use std::fmt;
use std::sync::Arc;

/// An immutable value produced on a [`crate::port::Port`].
///
/// Carries a port identifier, a hierarchical firing coordinate (`tag`), and
/// an opaque value. `Value` is generic so downstream crates can plug in
/// whatever payload type their token processors produce (strings, paths,
/// structured JSON, ...).
#[derive(Debug, Clone)]
pub struct Token<V> {
    /// The name of the port this token was produced on.
    pub name: Arc<str>,
    /// The hierarchical firing coordinate, e.g. `"0.3"` for the fourth
    /// firing of the first nesting level.
    pub tag: Arc<str>,
    /// The token's payload.
    pub value: V,
}

impl<V> Token<V> {
    /// Constructs a new token.
    pub fn new(name: impl Into<Arc<str>>, tag: impl Into<Arc<str>>, value: V) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            value,
        }
    }
}

/// One item delivered by a port's `get()`: either a data-carrying
/// [`Token`] or a distinguished [`TerminationToken`] announcing end of
/// stream.
#[derive(Debug, Clone)]
pub enum PortItem<V> {
    /// A regular data token.
    Token(Token<V>),
    /// The port has no more tokens to deliver.
    Termination(TerminationToken),
}

impl<V> PortItem<V> {
    /// Returns `true` if this item is a [`TerminationToken`].
    pub fn is_termination(&self) -> bool {
        matches!(self, PortItem::Termination(_))
    }

    /// The port name this item was produced on, regardless of variant.
    pub fn port_name(&self) -> &str {
        match self {
            PortItem::Token(token) => &token.name,
            PortItem::Termination(termination) => &termination.name,
        }
    }
}

/// A distinguished token kind signalling end-of-stream for a port.
///
/// Carries only the port name; every port emits exactly one of these, after
/// which no further items appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationToken {
    /// The name of the port that has terminated.
    pub name: Arc<str>,
}

impl TerminationToken {
    /// Constructs a termination token for the given port name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for TerminationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TerminationToken({})", self.name)
    }
}

/// Returns `true` iff every item in `items` is a [`PortItem::Termination`].
///
/// An empty list is vacuously not terminated (no combinator produces one);
/// this mirrors `streamflow.core.utils.check_termination`.
pub fn check_termination<V>(items: &[PortItem<V>]) -> bool {
    !items.is_empty() && items.iter().all(PortItem::is_termination)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn check_termination_requires_all_terminated() {
        let all_terminated: Vec<PortItem<i32>> = vec![
            PortItem::Termination(TerminationToken::new("a")),
            PortItem::Termination(TerminationToken::new("b")),
        ];
        assert!(check_termination(&all_terminated));

        let mixed: Vec<PortItem<i32>> = vec![
            PortItem::Termination(TerminationToken::new("a")),
            PortItem::Token(Token::new("b", "0", 1)),
        ];
        assert!(!check_termination(&mixed));

        assert!(!check_termination::<i32>(&[]));
    }
}
