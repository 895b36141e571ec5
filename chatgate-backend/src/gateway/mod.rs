pub mod actix_ws;
pub mod protocol;
pub mod relay;
