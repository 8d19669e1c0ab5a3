//! Sink adapter boundary: the row writer and its exporters.
//!
//! The merger hands finished row snapshots to a [`SinkAdapter`]. A single
//! writer task batches them, collapses repeated snapshots of one bucket and
//! upserts the batch into every configured exporter with bounded retries.

pub mod clickhouse;
pub mod exporter;
pub mod http;
pub mod memory;
pub mod writer;

pub use exporter::Exporter;
pub use writer::{spawn_writer, RetryPolicy, SinkAdapter};
