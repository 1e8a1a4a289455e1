//! Handler registry and ordering model.
//!
//! A [`HandlerRegistration`] records which routes a handler serves:
//!
//! | field | meaning |
//! |---|---|
//! | `handler` | handler identity, see [`HandlerId`] |
//! | `exchange` | exchange scope, `None` for every exchange |
//! | `patterns` | route patterns the handler serves |
//! | `order` | lower runs first |
//! | `sequence` | registration sequence, tie-breaker for equal orders |
//!
//! The registry is populated while the dispatcher is built and read-only
//! afterwards. Conflicts are detected at registration time by
//! [`validate_registration`], a pure function over the existing entries.

use std::any::TypeId;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use tracing::{debug, trace};
use warren_core::RoutePattern;

use crate::error::RegistrationError;
use crate::handler::Lifetime;

// ============================================================================
// HandlerId
// ============================================================================

/// Identifies a handler across registrations.
///
/// Unnamed handlers are keyed by their [`TypeId`], so every closure is its own
/// handler even when two closures share a type name. Named handlers are keyed
/// by the name. The label is what logs and errors show.
#[derive(Debug, Clone)]
pub struct HandlerId {
    type_id: Option<TypeId>,
    label: String,
}

impl HandlerId {
    /// Identifies the handler type `H`, labelled with its type name.
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: Some(TypeId::of::<H>()),
            label: std::any::type_name::<H>().to_string(),
        }
    }

    /// Identifies a handler by an explicit name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            type_id: None,
            label: name.into(),
        }
    }

    /// Returns the display label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PartialEq for HandlerId {
    fn eq(&self, other: &Self) -> bool {
        match (self.type_id, other.type_id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.label == other.label,
            _ => false,
        }
    }
}

impl Eq for HandlerId {}

impl Hash for HandlerId {
    fn hash<S: Hasher>(&self, state: &mut S) {
        match self.type_id {
            Some(id) => id.hash(state),
            None => self.label.hash(state),
        }
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl From<&str> for HandlerId {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for HandlerId {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

// ============================================================================
// HandlerRegistration
// ============================================================================

/// Registration metadata for one handler route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRegistration {
    /// Handler identity.
    pub handler: HandlerId,
    /// Exchange scope; `None` admits every exchange.
    pub exchange: Option<String>,
    /// Route patterns served by the handler.
    pub patterns: BTreeSet<RoutePattern>,
    /// Execution order. Lower runs first.
    pub order: i32,
    /// How handler instances are constructed.
    pub lifetime: Lifetime,
    /// Registration sequence, assigned by the registry.
    pub sequence: u64,
}

impl HandlerRegistration {
    /// Creates a global, order-0 singleton registration.
    ///
    /// # Errors
    ///
    /// Fails if no pattern is given or a pattern does not parse.
    pub fn new<I, S>(handler: impl Into<HandlerId>, patterns: I) -> Result<Self, RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let handler = handler.into();
        let patterns = patterns
            .into_iter()
            .map(|p| RoutePattern::new(p.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|source| RegistrationError::InvalidPattern {
                handler: handler.to_string(),
                source,
            })?;

        if patterns.is_empty() {
            return Err(RegistrationError::NoPatterns {
                handler: handler.to_string(),
            });
        }

        Ok(Self {
            handler,
            exchange: None,
            patterns,
            order: 0,
            lifetime: Lifetime::default(),
            sequence: 0,
        })
    }

    /// Restricts the registration to one exchange.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Sets the execution order.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Sets the handler lifetime.
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Returns `true` if deliveries from `exchange` are in scope.
    pub fn admits_exchange(&self, exchange: &str) -> bool {
        self.exchange.as_deref().is_none_or(|own| own == exchange)
    }

    /// Returns `true` if any pattern matches `routing_key`.
    pub fn matches(&self, routing_key: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(routing_key))
    }

    /// Returns `true` if both registrations can receive the same exchange.
    pub fn shares_scope(&self, other: &Self) -> bool {
        match (&self.exchange, &other.exchange) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    fn scope_label(&self) -> String {
        match &self.exchange {
            Some(exchange) => format!("exchange '{exchange}'"),
            None => "all exchanges".to_string(),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Checks `candidate` against `existing` registrations.
///
/// A candidate is a duplicate of an existing registration when both name the
/// same handler, share an exchange scope (the same exchange, or either one is
/// global), declare at least one identical route pattern, and disagree on the
/// order. Identical orders are accepted.
///
/// # Errors
///
/// Returns [`RegistrationError::DuplicateRegistration`] for the first conflict
/// and [`RegistrationError::EmptyExchange`] for an empty exchange scope.
pub fn validate_registration<'a, I>(
    existing: I,
    candidate: &HandlerRegistration,
) -> Result<(), RegistrationError>
where
    I: IntoIterator<Item = &'a HandlerRegistration>,
{
    if candidate.exchange.as_deref() == Some("") {
        return Err(RegistrationError::EmptyExchange {
            handler: candidate.handler.to_string(),
        });
    }

    for other in existing {
        if other.handler != candidate.handler
            || other.order == candidate.order
            || !other.shares_scope(candidate)
        {
            continue;
        }

        let shared: Vec<String> = other
            .patterns
            .intersection(&candidate.patterns)
            .map(|p| p.as_str().to_string())
            .collect();

        if !shared.is_empty() {
            let scope = if other.exchange.is_some() {
                other.scope_label()
            } else {
                candidate.scope_label()
            };
            return Err(RegistrationError::DuplicateRegistration {
                handler: candidate.handler.to_string(),
                scope,
                patterns: shared,
                existing_order: other.order,
                order: candidate.order,
            });
        }
    }

    Ok(())
}

// ============================================================================
// HandlerRegistry
// ============================================================================

/// An ordered collection of handler registrations, each carrying a value.
///
/// While building, `T` is the handler factory; once the dispatcher is built it
/// is the compiled pipeline.
#[derive(Debug, Clone)]
pub struct HandlerRegistry<T> {
    entries: Vec<(HandlerRegistration, T)>,
    next_sequence: u64,
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 0,
        }
    }
}

impl<T> HandlerRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a registration, assigning its sequence number.
    ///
    /// # Errors
    ///
    /// See [`validate_registration`].
    pub fn register(
        &mut self,
        mut registration: HandlerRegistration,
        value: T,
    ) -> Result<&HandlerRegistration, RegistrationError> {
        validate_registration(self.registrations(), &registration)?;

        registration.sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(
            handler = %registration.handler,
            exchange = registration.exchange.as_deref().unwrap_or("*"),
            order = registration.order,
            sequence = registration.sequence,
            "Registered handler"
        );

        self.entries.push((registration, value));
        let (registration, _) = &self.entries[self.entries.len() - 1];
        Ok(registration)
    }

    /// Returns the registrations that should handle a delivery.
    ///
    /// Entries are filtered by exchange scope and route match, sorted by order
    /// then registration sequence, and deduplicated by [`HandlerId`] so a
    /// handler runs at most once per delivery (its first entry wins).
    pub fn resolve(&self, routing_key: &str, exchange: &str) -> Vec<(&HandlerRegistration, &T)> {
        let mut matched: Vec<_> = self
            .entries
            .iter()
            .filter(|(reg, _)| reg.admits_exchange(exchange) && reg.matches(routing_key))
            .map(|(reg, value)| (reg, value))
            .collect();
        matched.sort_by_key(|(reg, _)| (reg.order, reg.sequence));

        let mut seen = HashSet::new();
        matched.retain(|(reg, _)| seen.insert(&reg.handler));

        trace!(routing_key, exchange, matched = matched.len(), "Resolved handlers");
        matched
    }

    /// Iterates over every registration in sequence order.
    pub fn registrations(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.entries.iter().map(|(reg, _)| reg)
    }

    /// Iterates over every entry in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = (&HandlerRegistration, &T)> {
        self.entries.iter().map(|(reg, value)| (reg, value))
    }

    /// Converts every value, keeping registrations and sequence numbers.
    pub fn map<U>(self, mut f: impl FnMut(&HandlerRegistration, T) -> U) -> HandlerRegistry<U> {
        HandlerRegistry {
            entries: self
                .entries
                .into_iter()
                .map(|(reg, value)| {
                    let mapped = f(&reg, value);
                    (reg, mapped)
                })
                .collect(),
            next_sequence: self.next_sequence,
        }
    }

    /// Returns the number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(handler: &str, patterns: &[&str]) -> HandlerRegistration {
        HandlerRegistration::new(handler, patterns).unwrap()
    }

    #[test]
    fn test_empty_pattern_list_rejected() {
        let err = HandlerRegistration::new("h", Vec::<&str>::new()).unwrap_err();
        assert!(matches!(err, RegistrationError::NoPatterns { .. }));

        let err = HandlerRegistration::new("h", [""]).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidPattern { .. }));
    }

    #[test]
    fn test_duplicate_with_different_order_rejected() {
        let existing = [reg("orders", &["orders.#", "audit.*"])
            .with_exchange("shop")
            .with_order(1)];
        let candidate = reg("orders", &["orders.#"]).with_exchange("shop").with_order(2);

        let err = validate_registration(&existing, &candidate).unwrap_err();
        match err {
            RegistrationError::DuplicateRegistration {
                patterns,
                existing_order,
                order,
                ..
            } => {
                assert_eq!(patterns, vec!["orders.#".to_string()]);
                assert_eq!((existing_order, order), (1, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_same_order_accepted() {
        let existing = [reg("orders", &["orders.#"]).with_exchange("shop").with_order(1)];
        let candidate = reg("orders", &["orders.#"]).with_exchange("shop").with_order(1);
        assert!(validate_registration(&existing, &candidate).is_ok());
    }

    #[test]
    fn test_global_scope_overlaps_every_exchange() {
        let existing = [reg("orders", &["orders.#"]).with_order(1)];
        let candidate = reg("orders", &["orders.#"]).with_exchange("shop").with_order(2);
        assert!(validate_registration(&existing, &candidate).is_err());
    }

    #[test]
    fn test_no_conflict_across_handlers_exchanges_or_patterns() {
        let existing = [reg("orders", &["orders.#"]).with_exchange("shop").with_order(1)];

        let other_handler = reg("invoices", &["orders.#"]).with_exchange("shop").with_order(2);
        let other_exchange = reg("orders", &["orders.#"]).with_exchange("eu").with_order(2);
        let other_pattern = reg("orders", &["orders.*"]).with_exchange("shop").with_order(2);

        assert!(validate_registration(&existing, &other_handler).is_ok());
        assert!(validate_registration(&existing, &other_exchange).is_ok());
        assert!(validate_registration(&existing, &other_pattern).is_ok());
    }

    #[test]
    fn test_empty_exchange_rejected() {
        let none: [HandlerRegistration; 0] = [];
        let candidate = reg("orders", &["orders.#"]).with_exchange("");
        assert!(matches!(
            validate_registration(&none, &candidate),
            Err(RegistrationError::EmptyExchange { .. })
        ));
    }

    #[test]
    fn test_resolve_orders_by_order_then_sequence() {
        let mut registry = HandlerRegistry::new();
        registry.register(reg("late", &["a.#"]).with_order(10), ()).unwrap();
        registry.register(reg("first", &["a.*.c"]).with_order(-1), ()).unwrap();
        registry.register(reg("tie_a", &["a.b.c"]).with_order(5), ()).unwrap();
        registry.register(reg("tie_b", &["#"]).with_order(5), ()).unwrap();
        registry.register(reg("miss", &["x.y"]), ()).unwrap();

        let handlers: Vec<&str> = registry
            .resolve("a.b.c", "shop")
            .into_iter()
            .map(|(reg, _)| reg.handler.label())
            .collect();
        assert_eq!(handlers, ["first", "tie_a", "tie_b", "late"]);
    }

    #[test]
    fn test_resolve_respects_exchange_scope() {
        let mut registry = HandlerRegistry::new();
        registry.register(reg("shop_only", &["#"]).with_exchange("shop"), ()).unwrap();
        registry.register(reg("global", &["#"]), ()).unwrap();

        assert_eq!(registry.resolve("k", "shop").len(), 2);
        let other: Vec<_> = registry.resolve("k", "billing");
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].0.handler.label(), "global");
    }

    #[test]
    fn test_resolve_runs_handler_once() {
        let mut registry = HandlerRegistry::new();
        registry.register(reg("h", &["a.#"]).with_order(2), 'x').unwrap();
        registry.register(reg("h", &["a.b"]).with_order(1), 'y').unwrap();

        let matched = registry.resolve("a.b", "shop");
        assert_eq!(matched.len(), 1);
        assert_eq!(*matched[0].1, 'y');
    }

    #[test]
    fn test_handler_identity_follows_type_not_label() {
        let first = |_: u8| ();
        let second = |_: u8| ();
        let (a, b) = (id_of(&first), id_of(&second));

        assert_eq!(a.label(), b.label());
        assert_ne!(a, b);
        assert_eq!(a, id_of(&first));
        assert_eq!(HandlerId::named("audit"), HandlerId::from("audit"));
        assert_ne!(HandlerId::named(a.label()), a);
    }

    fn id_of<H: 'static>(_: &H) -> HandlerId {
        HandlerId::of::<H>()
    }

    #[test]
    fn test_distinct_handler_types_both_resolve() {
        struct First;
        struct Second;
        let mut registry = HandlerRegistry::new();
        let first = HandlerRegistration::new(HandlerId::of::<First>(), ["#"]).unwrap();
        let second = HandlerRegistration::new(HandlerId::of::<Second>(), ["#"])
            .unwrap()
            .with_order(1);
        registry.register(first, 'a').unwrap();
        registry.register(second, 'b').unwrap();

        let matched: Vec<char> = registry.resolve("k", "shop").into_iter().map(|(_, v)| *v).collect();
        assert_eq!(matched, ['a', 'b']);
    }
}
