pub mod engine;
pub mod rewrite;
pub mod transport;
pub mod upstream;

pub use engine::ReverseProxy;
pub use rewrite::RewriteRule;
pub use transport::TunnelingTransport;
pub use upstream::{ReqwestExecutor, RequestExecutor};
