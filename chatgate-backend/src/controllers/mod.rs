pub mod admin;
pub mod auth;
pub mod conversations;
pub mod health;
pub mod memories;
