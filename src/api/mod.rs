pub mod error;
pub mod middleware;
pub mod routes;
pub mod token_bucket;

// Re-export public types and functions
pub use error::GatewayError;
pub use middleware::log_request_errors;
pub use routes::{
    CreateLinkRequest, StatusResponse, StreamParams, create_link, status, stream_resource,
};
pub use token_bucket::TokenBucket;
