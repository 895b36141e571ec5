//! Database model modules - extends Database with domain-specific methods
//!
//! Each module adds `impl Database` blocks with methods for a specific table group.

mod auth;             // auth_sessions, password_resets
mod conversations;    // conversations, messages
mod gateway_settings; // gateway_settings
mod memories;         // memories
mod models;           // models
pub mod providers;    // providers
mod usage;            // usage_records
mod users;            // users
