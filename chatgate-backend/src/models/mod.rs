pub mod conversation;
pub mod gateway_settings;
pub mod memory;
pub mod model;
pub mod session;
pub mod usage;
pub mod user;

pub use conversation::{Conversation, Message, MessageRole};
pub use gateway_settings::{GatewaySettings, UpdateGatewaySettingsRequest, DEFAULT_RATE_LIMIT};
pub use memory::{Memory, MemoryCategory, MAX_IMPORTANCE, MIN_IMPORTANCE};
pub use model::{AiModel, NewModel, Provider};
pub use session::Session;
pub use usage::{LeaderboardEntry, UsageRecord};
pub use user::{Identity, User, UserRole};
