//! 用户消息组装
//!
//! 把用户原始输入与附带的上下文（文件片段等）拼成一条 User 消息。

use serde::{Deserialize, Serialize};

use crate::memory::Message;

/// 随用户输入一起发送的上下文附件
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// 附件名（通常是文件路径）
    pub name: String,
    pub content: String,
}

impl Attachment {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// 消息组装契约
pub trait MessageComposer: Send + Sync {
    fn compose_user_message(&self, raw_input: &str, attachments: &[Attachment]) -> Message;
}

/// 默认组装：原文在前，每个附件包成一个 <context> 块追加在后
#[derive(Debug, Default)]
pub struct DefaultComposer;

impl MessageComposer for DefaultComposer {
    fn compose_user_message(&self, raw_input: &str, attachments: &[Attachment]) -> Message {
        if attachments.is_empty() {
            return Message::user(raw_input);
        }

        let mut content = String::from(raw_input);
        for attachment in attachments {
            content.push_str(&format!(
                "\n\n<context file=\"{}\">\n{}\n</context>",
                attachment.name, attachment.content
            ));
        }
        Message::user(content)
    }
}
