//! The query engine: filter evaluation, zone-map predicate pushdown, projections and the
//! aggregation pipeline. Everything here is pure row-set computation; I/O stays in the table
//! facade and the columnar layer.

pub mod aggregate;
pub mod filter;
pub mod projection;
pub mod pushdown;

pub use aggregate::{AggregationResult, Pipeline};
pub use filter::Filter;
pub use projection::Projection;
pub use pushdown::{file_can_skip, row_group_can_skip, to_zone_predicates, ZonePredicate};
