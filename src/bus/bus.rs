//! In-memory bus - type-indexed synchronous publish/subscribe.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, trace};

use super::Publisher;
use crate::message::{
    downcast_message, Message, MessageRegistry, MessageType, RegistryError, TypeTag,
};
use crate::queued::QueuedHandler;
use crate::sync::{read, write};

/// A bus route: receives every message published under its tag.
pub type Route = Arc<dyn Fn(&Arc<dyn Message>) + Send + Sync>;

/// Handle returned by every subscribe call; pass it to
/// [`Bus::unsubscribe`] to remove the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    tag: TypeTag,
}

impl Subscription {
    pub fn tag(&self) -> TypeTag {
        self.tag
    }
}

#[derive(Clone)]
struct Entry {
    id: u64,
    route: Route,
    /// Only runs for messages whose runtime type is the subscribed tag.
    exact: bool,
}

struct BusInner {
    name: String,
    registry: Arc<MessageRegistry>,
    routes: RwLock<HashMap<TypeTag, Vec<Entry>>>,
    next_id: AtomicU64,
}

/// In-process message bus.
///
/// Publishing is synchronous: every current subscriber of the message's
/// runtime type and of each of its ancestors runs on the caller's thread,
/// in the order the subscriptions were made. Ordering and threading come
/// from wrapping a subscriber in a [`QueuedHandler`]
/// (see [`subscribe_queued`](Self::subscribe_queued)).
///
/// A subscriber that panics is logged and skipped; the others still run.
/// No lock is held while subscribers run, so they may publish, subscribe
/// or unsubscribe re-entrantly.
///
/// `Bus` is a cheap handle; clones share one registry of subscriptions.
///
/// ## Example
///
/// ```ignore
/// let bus = Bus::new("orders");
///
/// let sub = bus.subscribe(|placed: &OrderPlaced| {
///     println!("placed {}", placed.order_id);
/// })?;
///
/// // Every event, whatever its concrete type.
/// bus.subscribe_family::<AnyEvent, _>(|event| println!("{}", event.type_name()))?;
///
/// bus.publish(OrderPlaced::new("o-1"));
/// bus.unsubscribe(&sub);
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Bus backed by the process-wide type registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_registry(name, MessageRegistry::global())
    }

    /// Bus with its own registry, independent of other buses.
    pub fn with_registry(name: impl Into<String>, registry: Arc<MessageRegistry>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                registry,
                routes: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.inner.registry
    }

    /// Register `T` (and its declared parents) with this bus's registry.
    pub fn register<T: MessageType>(&self) -> Result<TypeTag, RegistryError> {
        self.inner.registry.register::<T>()
    }

    /// Subscribe to exactly `T`.
    ///
    /// A typed handler only ever sees `T` itself: a type declared below `T`
    /// is a different struct and cannot be handed over as `&T`. Use
    /// [`subscribe_family`](Self::subscribe_family) to receive `T` together
    /// with its subtypes.
    pub fn subscribe<T, F>(&self, handler: F) -> Result<Subscription, RegistryError>
    where
        T: Message + MessageType,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let tag = self.register::<T>()?;
        Ok(self.add_route(
            tag,
            Arc::new(move |message: &Arc<dyn Message>| {
                if let Some(typed) = message.as_any().downcast_ref::<T>() {
                    handler(typed);
                }
            }),
            true,
        ))
    }

    /// Subscribe to `F` and every type declared below it, e.g. `AnyEvent`.
    pub fn subscribe_family<F, H>(&self, handler: H) -> Result<Subscription, RegistryError>
    where
        F: MessageType,
        H: Fn(&Arc<dyn Message>) + Send + Sync + 'static,
    {
        let tag = self.register::<F>()?;
        Ok(self.subscribe_tag(tag, Arc::new(handler)))
    }

    /// Route every `T` into `queue`. Exact like [`subscribe`](Self::subscribe).
    pub fn subscribe_queued<T>(&self, queue: &QueuedHandler<T>) -> Result<Subscription, RegistryError>
    where
        T: Message + MessageType,
    {
        let tag = self.register::<T>()?;
        let queue = queue.clone();
        Ok(self.add_route(
            tag,
            Arc::new(move |message: &Arc<dyn Message>| {
                if let Some(typed) = downcast_message::<T>(message) {
                    queue.enqueue(typed);
                }
            }),
            true,
        ))
    }

    /// Route `F` and its descendants into `queue`.
    pub fn subscribe_family_queued<F>(
        &self,
        queue: &QueuedHandler<dyn Message>,
    ) -> Result<Subscription, RegistryError>
    where
        F: MessageType,
    {
        let tag = self.register::<F>()?;
        let queue = queue.clone();
        Ok(self.subscribe_tag(
            tag,
            Arc::new(move |message: &Arc<dyn Message>| {
                queue.enqueue(Arc::clone(message));
            }),
        ))
    }

    /// Subscribe a raw route to an already registered tag. The route sees
    /// the tag and every type below it.
    pub fn subscribe_tag(&self, tag: TypeTag, route: Route) -> Subscription {
        self.add_route(tag, route, false)
    }

    fn add_route(&self, tag: TypeTag, route: Route, exact: bool) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        write(&self.inner.routes)
            .entry(tag)
            .or_default()
            .push(Entry { id, route, exact });

        debug!(
            bus = %self.inner.name,
            message_type = self.inner.registry.name_of(tag).unwrap_or("?"),
            subscription = id,
            exact,
            "subscribed"
        );
        Subscription { id, tag }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut routes = write(&self.inner.routes);
        let Some(entries) = routes.get_mut(&subscription.tag) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != subscription.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            routes.remove(&subscription.tag);
        }
        drop(routes);

        if removed {
            debug!(bus = %self.inner.name, subscription = subscription.id, "unsubscribed");
        }
        removed
    }

    /// Publish a message. Returns how many subscribers it was handed to.
    pub fn publish<M: Message>(&self, message: M) -> usize {
        self.publish_arc(Arc::new(message))
    }

    /// Publish an already shared message.
    pub fn publish_arc(&self, message: Arc<dyn Message>) -> usize {
        let registry = &self.inner.registry;
        let tag = match registry.ensure(message.descriptor()) {
            Ok(tag) => tag,
            Err(err) => {
                error!(bus = %self.inner.name, error = %err, "cannot publish unregistrable message type");
                return 0;
            }
        };

        let mut entries: Vec<Entry> = {
            let routes = read(&self.inner.routes);
            let own = routes.get(&tag).into_iter().flatten();
            let inherited = registry
                .ancestors(tag)
                .into_iter()
                .filter_map(|t| routes.get(&t))
                .flatten()
                .filter(|entry| !entry.exact);
            let collected: Vec<Entry> = own.chain(inherited).cloned().collect();
            collected
        };
        entries.sort_by_key(|entry| entry.id);

        trace!(
            bus = %self.inner.name,
            message_type = message.type_name(),
            message_id = %message.id(),
            subscribers = entries.len(),
            "publish"
        );

        for entry in &entries {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (entry.route)(&message)));
            if let Err(payload) = outcome {
                error!(
                    bus = %self.inner.name,
                    message_type = message.type_name(),
                    subscription = entry.id,
                    panic = %crate::sync::panic_message(payload.as_ref()),
                    "subscriber panicked"
                );
            }
        }
        entries.len()
    }

    /// True if someone subscribed to `T` itself, or with `include_derived`
    /// to any registered type below it.
    pub fn has_subscriber_for<T: MessageType>(&self, include_derived: bool) -> bool {
        let Some(tag) = self.inner.registry.tag_of::<T>() else {
            return false;
        };
        self.has_subscriber_for_tag(tag, include_derived)
    }

    pub fn has_subscriber_for_tag(&self, tag: TypeTag, include_derived: bool) -> bool {
        let routes = read(&self.inner.routes);
        if routes.get(&tag).is_some_and(|entries| !entries.is_empty()) {
            return true;
        }
        include_derived
            && self
                .inner
                .registry
                .descendants(tag)
                .iter()
                .any(|t| routes.get(t).is_some_and(|entries| !entries.is_empty()))
    }

    /// Total live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        read(&self.inner.routes).values().map(Vec::len).sum()
    }
}

impl Publisher for Bus {
    fn publish_message(&self, message: Arc<dyn Message>) {
        self.publish_arc(message);
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.inner.name)
            .field("subscriptions", &self.subscriber_count())
            .finish()
    }
}
