//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and HTTP endpoint

pub mod events;
pub mod server;

pub use server::{MetricsController, init_global, init_test};

/// Emit an internal metric event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding counter, gauge or histogram.
///
/// ```ignore
/// use honeycomb_core::metrics::events::EventsInserted;
///
/// emit!(EventsInserted { count: 100, target: "cowrie.json".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
