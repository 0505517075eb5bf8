pub mod client;
pub mod pagination;

pub use client::{SearchApi, SearchClient, SearchOptions};
pub use pagination::{search_once, PaginationController, PaginationSummary};
