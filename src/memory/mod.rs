//! 记忆层：按会话隔离的对话历史与用户消息组装

pub mod composer;
pub mod conversation;

pub use composer::{Attachment, DefaultComposer, MessageComposer};
pub use conversation::{
    ConversationKey, ConversationMemory, InMemoryConversationStore, Message, Role,
};
