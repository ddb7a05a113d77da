//! 对话记忆：按会话键隔离的有序消息日志
//!
//! 编排器只通过 ConversationMemory trait 访问历史（判空、追加、读取全部、撤销最后一条）；
//! 内置实现 InMemoryConversationStore 自带互斥锁，可被多个任务共享。

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 会话键：标识一条对话在 ConversationMemory 中的归属
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// 随机生成新的会话键
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationKey {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConversationKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 对话记忆契约：所有操作按会话键隔离，实现必须可跨任务共享
pub trait ConversationMemory: Send + Sync {
    fn is_empty(&self, key: &ConversationKey) -> bool;

    fn append(&self, key: &ConversationKey, message: Message);

    /// 按追加顺序返回该会话的全部消息
    fn read_all(&self, key: &ConversationKey) -> Vec<Message>;

    /// 移除最后一条消息（失败回滚用）
    fn remove_last(&self, key: &ConversationKey) -> Option<Message>;
}

/// 进程内对话存储：HashMap<会话键, 消息列表>，内部加锁
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<ConversationKey, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, key: &ConversationKey) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    /// 清空某个会话
    pub fn clear(&self, key: &ConversationKey) {
        self.lock().remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, Vec<Message>>> {
        // 持锁区间内不会 panic，中毒时直接沿用内部数据
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConversationMemory for InMemoryConversationStore {
    fn is_empty(&self, key: &ConversationKey) -> bool {
        self.lock().get(key).map_or(true, Vec::is_empty)
    }

    fn append(&self, key: &ConversationKey, message: Message) {
        self.lock().entry(key.clone()).or_default().push(message);
    }

    fn read_all(&self, key: &ConversationKey) -> Vec<Message> {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    fn remove_last(&self, key: &ConversationKey) -> Option<Message> {
        self.lock().get_mut(key).and_then(Vec::pop)
    }
}
