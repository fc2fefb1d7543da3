//! Hierarchical topic router.
//!
//! Topics are `/`-delimited segment paths such as `vehicle/007/heartbeat`.
//! Patterns use two wildcards:
//!
//! | Wildcard | Matches |
//! |---|---|
//! | `+` | exactly one segment |
//! | `#` | one or more trailing segments (final position only) |
//!
//! [`TopicRouter::dispatch`] hands a payload to every handler whose pattern
//! matches, in registration order. A handler that returns an error or panics
//! is logged and skipped; the remaining handlers still run.
//!
//! # Example
//!
//! ```rust
//! use fleetwatch_middleware::TopicRouter;
//! use serde_json::json;
//!
//! let router = TopicRouter::new();
//! let sub = router
//!     .register("vehicle/+/heartbeat", |topic, _payload| {
//!         assert_eq!(topic, "vehicle/007/heartbeat");
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(router.dispatch("vehicle/007/heartbeat", &json!({})), 1);
//! sub.unregister();
//! assert_eq!(router.dispatch("vehicle/007/heartbeat", &json!({})), 0);
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use fleetwatch_types::FleetError;
use serde_json::Value;
use tracing::{error, warn};

/// Callback invoked with `(topic, payload)` for every matching message.
pub type TopicHandler = Arc<dyn Fn(&str, &Value) -> Result<(), FleetError> + Send + Sync>;

const SINGLE_WILDCARD: &str = "+";
const MULTI_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Rest,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse `raw` into a segment matcher.
    ///
    /// # Errors
    ///
    /// [`FleetError::InvalidPattern`] when the pattern is empty, when `#`
    /// appears anywhere but the final segment, or when a wildcard shares a
    /// segment with other characters (`veh+`, `a#b`).
    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        if raw.is_empty() {
            return Err(FleetError::InvalidPattern("empty pattern".to_string()));
        }

        let parts: Vec<&str> = raw.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                SINGLE_WILDCARD => Segment::Single,
                MULTI_WILDCARD if i == last => Segment::Rest,
                MULTI_WILDCARD => {
                    return Err(FleetError::InvalidPattern(format!(
                        "'{raw}': '#' is only allowed as the final segment"
                    )));
                }
                literal if literal.contains(['+', '#']) => {
                    return Err(FleetError::InvalidPattern(format!(
                        "'{raw}': wildcard mixed into segment '{literal}'"
                    )));
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The pattern as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Structural match of a concrete topic against this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');

        for segment in &self.segments {
            match segment {
                // Needs at least one remaining level; it swallows the rest.
                Segment::Rest => return levels.next().is_some(),
                Segment::Single => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }

        levels.next().is_none()
    }
}

struct Registration {
    id: u64,
    pattern: TopicPattern,
    handler: TopicHandler,
}

#[derive(Default)]
struct RouterInner {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration>>,
}

impl RouterInner {
    fn registrations(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared listener registry. Clone it cheaply; all clones share the same
/// registrations.
#[derive(Clone, Default)]
pub struct TopicRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRouter")
            .field("registrations", &self.len())
            .finish()
    }
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `pattern`.
    ///
    /// The returned [`Subscription`] removes exactly this pair, leaving other
    /// handlers on the same pattern untouched.
    pub fn register<F>(&self, pattern: &str, handler: F) -> Result<Subscription, FleetError>
    where
        F: Fn(&str, &Value) -> Result<(), FleetError> + Send + Sync + 'static,
    {
        let pattern = TopicPattern::parse(pattern)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let raw = pattern.as_str().to_string();

        self.inner.registrations().push(Registration {
            id,
            pattern,
            handler: Arc::new(handler),
        });

        Ok(Subscription {
            id,
            pattern: raw,
            router: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver `payload` to every handler whose pattern matches `topic`.
    ///
    /// Returns the number of handlers that were invoked (including ones that
    /// failed). Handlers run outside the registry lock against a snapshot
    /// taken at the start of the call, so registering or unregistering from
    /// inside a handler only affects later dispatches.
    pub fn dispatch(&self, topic: &str, payload: &Value) -> usize {
        let matched: Vec<(String, TopicHandler)> = self
            .inner
            .registrations()
            .iter()
            .filter(|r| r.pattern.matches(topic))
            .map(|r| (r.pattern.as_str().to_string(), Arc::clone(&r.handler)))
            .collect();

        for (pattern, handler) in &matched {
            match catch_unwind(AssertUnwindSafe(|| handler(topic, payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(topic = %topic, pattern = %pattern, error = %e, "topic handler failed");
                }
                Err(_) => {
                    error!(topic = %topic, pattern = %pattern, "topic handler panicked");
                }
            }
        }

        matched.len()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.inner.registrations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability returned by [`TopicRouter::register`].
///
/// Dropping it does **not** unregister; call [`Subscription::unregister`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pattern: String,
    router: Weak<RouterInner>,
}

impl Subscription {
    /// Remove this registration. Safe to call repeatedly, from any thread,
    /// and from inside a dispatch. Returns `true` only on the call that
    /// actually removed it.
    pub fn unregister(&self) -> bool {
        let Some(router) = self.router.upgrade() else {
            return false;
        };
        let mut registrations = router.registrations();
        let before = registrations.len();
        registrations.retain(|r| r.id != self.id);
        registrations.len() != before
    }

    /// The pattern this subscription was registered under.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
