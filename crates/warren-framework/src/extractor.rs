//! Extractor system for the Warren framework.
//!
//! This module provides the [`FromContext`] trait, which defines how types
//! can be extracted from a [`MessageContext`] for use as handler parameters.
//!
//! ```rust,ignore
//! async fn on_order(Json(order): Json<Order>, key: RoutingKey) -> Result<(), BoxError> {
//!     tracing::info!(%key, id = order.id, "order received");
//!     Ok(())
//! }
//! ```

use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use warren_core::{BoxedPublisher, MessageContext};

use crate::error::{ExtractError, ExtractResult};

/// A trait for types that can be extracted from a [`MessageContext`].
///
/// Types implementing this trait can be used directly as handler function
/// parameters. When extraction fails the handler is not called and the
/// [`ExtractError`] becomes the handler's error.
///
/// # Example
///
/// ```rust,ignore
/// struct TenantId(String);
///
/// impl FromContext for TenantId {
///     fn from_context(ctx: &Arc<MessageContext>) -> ExtractResult<Self> {
///         ctx.routing_key()
///             .split('.')
///             .next()
///             .map(|t| TenantId(t.to_string()))
///             .ok_or_else(|| ExtractError::custom("routing key has no tenant"))
///     }
/// }
/// ```
pub trait FromContext: Sized {
    /// Attempts to extract this type from the given context.
    fn from_context(ctx: &Arc<MessageContext>) -> ExtractResult<Self>;
}

impl FromContext for Arc<MessageContext> {
    fn from_context(ctx: &Arc<MessageContext>) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx))
    }
}

/// Implementation for `Option<T>` where `T: FromContext`.
///
/// Extraction never fails; a failed inner extraction yields `None`.
impl<T: FromContext> FromContext for Option<T> {
    fn from_context(ctx: &Arc<MessageContext>) -> ExtractResult<Self> {
        Ok(T::from_context(ctx).ok())
    }
}

macro_rules! newtype_extractor {
    ($(#[$meta:meta])* $name:ident($inner:ty), |$ctx:ident| $body:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub $inner);

        impl Deref for $name {
            type Target = $inner;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl FromContext for $name {
            fn from_context($ctx: &Arc<MessageContext>) -> ExtractResult<Self> {
                Ok($name($body))
            }
        }
    };
}

newtype_extractor!(
    /// The delivery's routing key.
    RoutingKey(String),
    |ctx| ctx.routing_key().to_string()
);

newtype_extractor!(
    /// The exchange the delivery arrived through.
    Exchange(String),
    |ctx| ctx.exchange().to_string()
);

newtype_extractor!(
    /// The delivery tag.
    DeliveryTag(u64),
    |ctx| ctx.delivery_tag()
);

newtype_extractor!(
    /// The raw payload.
    Body(Bytes),
    |ctx| ctx.payload().clone()
);

newtype_extractor!(
    /// Whether the broker delivered this message before.
    Redelivered(bool),
    |ctx| ctx.is_redelivered()
);

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The payload decoded as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl Deref for Text {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromContext for Text {
    fn from_context(ctx: &Arc<MessageContext>) -> ExtractResult<Self> {
        Ok(Text(ctx.text()?.to_string()))
    }
}

/// The payload deserialized from JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: DeserializeOwned> FromContext for Json<T> {
    fn from_context(ctx: &Arc<MessageContext>) -> ExtractResult<Self> {
        ctx.json::<T>().map(Json).map_err(|e| ExtractError::Json {
            expected: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}

/// The publisher attached to the dispatcher.
///
/// Fails with [`ExtractError::MissingPublisher`] when none is configured; use
/// `Option<PublisherHandle>` for handlers that publish only when possible.
#[derive(Clone)]
pub struct PublisherHandle(pub BoxedPublisher);

impl Deref for PublisherHandle {
    type Target = BoxedPublisher;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromContext for PublisherHandle {
    fn from_context(ctx: &Arc<MessageContext>) -> ExtractResult<Self> {
        ctx.publisher()
            .cloned()
            .map(PublisherHandle)
            .ok_or(ExtractError::MissingPublisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_core::Delivery;

    fn ctx(payload: &'static [u8]) -> Arc<MessageContext> {
        Arc::new(MessageContext::new(Delivery::new(
            3,
            "shop",
            "orders.created",
            payload,
        )))
    }

    #[test]
    fn test_plain_extractors() {
        let ctx = ctx(b"hello");
        assert_eq!(RoutingKey::from_context(&ctx).unwrap().0, "orders.created");
        assert_eq!(Exchange::from_context(&ctx).unwrap().0, "shop");
        assert_eq!(DeliveryTag::from_context(&ctx).unwrap().0, 3);
        assert_eq!(&*Text::from_context(&ctx).unwrap(), "hello");
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let ctx = ctx(&[0xff, 0xfe]);
        assert!(matches!(
            Text::from_context(&ctx),
            Err(ExtractError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_json_extractor() {
        #[derive(serde::Deserialize)]
        struct Order {
            id: u32,
        }

        let Json(order) = Json::<Order>::from_context(&ctx(br#"{"id":9}"#)).unwrap();
        assert_eq!(order.id, 9);
        assert!(matches!(
            Json::<Order>::from_context(&ctx(b"not json")),
            Err(ExtractError::Json { .. })
        ));
    }

    #[test]
    fn test_missing_publisher() {
        let ctx = ctx(b"");
        assert!(matches!(
            PublisherHandle::from_context(&ctx),
            Err(ExtractError::MissingPublisher)
        ));
        assert!(
            Option::<PublisherHandle>::from_context(&ctx)
                .unwrap()
                .is_none()
        );
    }
}
