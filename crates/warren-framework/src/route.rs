//! Route declarations.
//!
//! [`on_routes`] starts a route declaration; `.handler(f)` finishes it:
//!
//! ```rust,ignore
//! use warren::prelude::*;
//!
//! let dispatcher = Dispatcher::builder()
//!     .route(on_routes(["orders.*.created"]).exchange("shop").order(10).handler(on_created))?
//!     .route(on_routes(["#"]).order(100).named("audit").handler(audit))?
//!     .build();
//! ```

use crate::error::RegistrationError;
use crate::handler::{Handler, HandlerFactory, Lifetime};
use crate::registry::{HandlerId, HandlerRegistration};

/// Starts a route declaration for `patterns`.
pub fn on_routes<I, S>(patterns: I) -> RouteBuilder
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    RouteBuilder {
        patterns: patterns.into_iter().map(Into::into).collect(),
        exchange: None,
        order: 0,
        lifetime: Lifetime::default(),
        name: None,
    }
}

/// A route declaration awaiting its handler.
#[derive(Debug, Clone)]
pub struct RouteBuilder {
    patterns: Vec<String>,
    exchange: Option<String>,
    order: i32,
    lifetime: Lifetime,
    name: Option<String>,
}

impl RouteBuilder {
    /// Restricts the route to one exchange.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Sets the execution order. Lower runs first; the default is 0.
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Sets the handler lifetime. The default is [`Lifetime::Singleton`].
    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Names the handler.
    ///
    /// Unnamed handlers are identified by type and labelled with their type
    /// name. A named handler is identified by its name, so routes sharing a
    /// name count as one handler.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Finishes the route with `handler`.
    ///
    /// Transient routes hand out a fresh clone of `handler` per delivery.
    pub fn handler<H, T>(self, handler: H) -> Route
    where
        H: Handler<T>,
        T: 'static,
    {
        let id = self.id::<H>();
        let factory = HandlerFactory::from_handler(self.lifetime, handler);
        self.finish(id, factory)
    }

    /// Finishes the route with a handler constructor.
    ///
    /// Singleton routes call `make` once when the dispatcher is built;
    /// transient routes call it for every delivery.
    pub fn factory<F, H, T>(self, make: F) -> Route
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler<T>,
        T: 'static,
    {
        let id = self.id::<H>();
        let factory = HandlerFactory::new(self.lifetime, make);
        self.finish(id, factory)
    }

    fn id<H: 'static>(&self) -> HandlerId {
        match &self.name {
            Some(name) => HandlerId::named(name.as_str()),
            None => HandlerId::of::<H>(),
        }
    }

    fn finish(self, handler: HandlerId, factory: HandlerFactory) -> Route {
        Route {
            handler,
            patterns: self.patterns,
            exchange: self.exchange,
            order: self.order,
            factory,
        }
    }
}

/// A complete route declaration, ready to be registered.
#[derive(Debug, Clone)]
pub struct Route {
    handler: HandlerId,
    patterns: Vec<String>,
    exchange: Option<String>,
    order: i32,
    factory: HandlerFactory,
}

impl Route {
    /// Returns the handler identity.
    pub fn handler_id(&self) -> &HandlerId {
        &self.handler
    }

    /// Parses the declaration into registration metadata and its factory.
    ///
    /// # Errors
    ///
    /// Fails when no pattern was given or a pattern does not parse.
    pub fn into_parts(self) -> Result<(HandlerRegistration, HandlerFactory), RegistrationError> {
        let mut registration = HandlerRegistration::new(self.handler, self.patterns)?
            .with_order(self.order)
            .with_lifetime(self.factory.lifetime());
        if let Some(exchange) = self.exchange {
            registration = registration.with_exchange(exchange);
        }
        Ok((registration, self.factory))
    }
}
