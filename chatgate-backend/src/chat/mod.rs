mod orchestrator;

pub use orchestrator::{ChatOrchestrator, ChatTurn, StreamOutcome, HISTORY_LIMIT};
