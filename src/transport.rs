pub mod http_server;
pub mod push;

pub use http_server::{protocol_router, ApiError, ProtocolServer};
pub use push::HttpEventPusher;
