//! Tunnel Elasticsearch requests through Kibana's console proxy endpoint.
//!
//! The [`proxy`] module rewrites arbitrary requests into the console proxy
//! form and serves them as a local reverse proxy; [`search`] issues single
//! searches or walks result pages with a point in time and `search_after`.

pub mod config;
pub mod error;
pub mod observability;
pub mod proxy;
pub mod search;
