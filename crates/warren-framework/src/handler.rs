//! Handler system for the Warren framework.
//!
//! Handlers are plain async functions. The [`Handler`] trait is implemented
//! via blanket implementations for functions taking up to eight
//! [`FromContext`] parameters, in the style of Axum's handler system.
//!
//! # Example
//!
//! ```rust,ignore
//! // No parameters
//! async fn ping() {}
//!
//! // Extractors and a fallible return
//! async fn on_order(ctx: Arc<MessageContext>, Json(order): Json<Order>) -> Result<(), BoxError> {
//!     store(order).await?;
//!     ctx.ack();
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tower::BoxError;
use warren_core::MessageContext;

use crate::extractor::FromContext;

// ============================================================================
// IntoHandlerResult - Handle handler return values
// ============================================================================

/// Types that can be returned from handlers.
pub trait IntoHandlerResult: Send {
    /// Converts the return value into the pipeline's result.
    fn into_handler_result(self) -> Result<(), BoxError>;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E> IntoHandlerResult for Result<(), E>
where
    E: Into<BoxError> + Send,
{
    fn into_handler_result(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

// ============================================================================
// Handler Trait
// ============================================================================

/// The core trait for message handlers.
///
/// # Blanket Implementation
///
/// This trait is automatically implemented for async functions that:
/// - Take 0-8 parameters that implement [`FromContext`]
/// - Return `()` or `Result<(), E>` with `E: Into<BoxError>`
///
/// If any parameter fails to extract, the handler is not called and the
/// extraction error is returned instead.
pub trait Handler<T>: Clone + Send + Sync + 'static {
    /// Calls the handler with the given context.
    fn call(self, ctx: Arc<MessageContext>) -> BoxFuture<'static, Result<(), BoxError>>;
}

/// Macro to generate Handler implementations for functions with different arities.
macro_rules! impl_handler {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_variables)]
        impl<F, Fut, Res, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: FnOnce($($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: IntoHandlerResult + 'static,
            $( $ty: FromContext + Send + 'static, )*
        {
            fn call(self, ctx: Arc<MessageContext>) -> BoxFuture<'static, Result<(), BoxError>> {
                Box::pin(async move {
                    $(
                        let $ty = $ty::from_context(&ctx)?;
                    )*

                    (self)($($ty,)*).await.into_handler_result()
                })
            }
        }
    };
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);
impl_handler!(T1, T2, T3, T4, T5);
impl_handler!(T1, T2, T3, T4, T5, T6);
impl_handler!(T1, T2, T3, T4, T5, T6, T7);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8);

// ============================================================================
// BoxedHandler - Type-erased handler
// ============================================================================

/// A type-erased handler.
pub type BoxedHandler =
    Arc<dyn Fn(Arc<MessageContext>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Converts a handler function into a boxed handler.
pub fn into_handler<H, T>(handler: H) -> BoxedHandler
where
    H: Handler<T>,
    T: 'static,
{
    Arc::new(move |ctx| handler.clone().call(ctx))
}

// ============================================================================
// Lifetime + HandlerFactory
// ============================================================================

/// How often a handler instance is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    /// A new instance for every delivery.
    Transient,
    /// One instance, built once when the dispatcher is built.
    #[default]
    Singleton,
}

/// Explicit factory producing handler instances.
///
/// The factory is resolved when the dispatcher is built: a singleton factory is
/// invoked exactly once, a transient factory is stored and invoked per delivery.
#[derive(Clone)]
pub struct HandlerFactory {
    lifetime: Lifetime,
    make: Arc<dyn Fn() -> BoxedHandler + Send + Sync>,
}

impl HandlerFactory {
    /// Creates a factory from a constructor closure.
    pub fn new<F, H, T>(lifetime: Lifetime, make: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler<T>,
        T: 'static,
    {
        Self {
            lifetime,
            make: Arc::new(move || into_handler(make())),
        }
    }

    /// Creates a factory that hands out clones of `handler`.
    pub fn from_handler<H, T>(lifetime: Lifetime, handler: H) -> Self
    where
        H: Handler<T>,
        T: 'static,
    {
        Self::new(lifetime, move || handler.clone())
    }

    /// Returns the factory's lifetime.
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Resolves the factory according to its lifetime.
    pub fn resolve(&self) -> ResolvedHandler {
        match self.lifetime {
            Lifetime::Singleton => ResolvedHandler::Shared((self.make)()),
            Lifetime::Transient => ResolvedHandler::PerDelivery(Arc::clone(&self.make)),
        }
    }
}

impl std::fmt::Debug for HandlerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerFactory")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// A handler source after factory resolution.
#[derive(Clone)]
pub enum ResolvedHandler {
    /// The singleton instance.
    Shared(BoxedHandler),
    /// The stored constructor, invoked per delivery.
    PerDelivery(Arc<dyn Fn() -> BoxedHandler + Send + Sync>),
}

impl ResolvedHandler {
    /// Returns the handler instance to use for one delivery.
    pub fn instance(&self) -> BoxedHandler {
        match self {
            Self::Shared(handler) => Arc::clone(handler),
            Self::PerDelivery(make) => make(),
        }
    }
}
