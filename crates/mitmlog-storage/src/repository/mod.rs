//! Database repositories for each table.

pub mod requests;

pub use requests::{serialize_headers, RequestsRepo, HEADER_SEPARATOR};
