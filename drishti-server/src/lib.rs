//! HTTP surface of the Drishti detection service.

pub mod http;
pub mod negotiation;

pub use http::{create_router, ApiError, ApiState, ErrorResponse};
pub use negotiation::negotiate_image;
