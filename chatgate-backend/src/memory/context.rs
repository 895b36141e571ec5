use crate::models::Memory;

/// Maximum number of memories rendered into one request's context
pub const MEMORY_CONTEXT_LIMIT: i64 = 10;

/// Render memories as the body of a system message, or `None` if there are none.
pub fn render_memory_context(memories: &[Memory]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }

    let mut text = String::from(
        "Things you remember about this user from earlier conversations. \
         Use them when relevant; do not mention this list.\n",
    );
    for memory in memories {
        text.push_str(&format!("- [{}] {}\n", memory.category, memory.content));
    }
    Some(text)
}
