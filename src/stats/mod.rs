//! Traffic statistics
//!
//! Each proxy owns a [`StatsCollector`]; counters are plain atomics so every
//! connection worker can update them without coordination. Updates are also
//! mirrored to the `metrics` facade, labelled with the instance name, for
//! whichever recorder the embedding application installs.

mod collector;

pub use collector::{default_collector, StatsCollector, StatsSnapshot};
pub(crate) use collector::ConnectionGuard;
