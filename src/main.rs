//! promptexec 命令行
//!
//! 入口：初始化日志、加载配置、为一个会话创建编排器，然后逐行读取 stdin 提交。
//! `/stop` 取消当前调用，`/history` 打印会话记忆，`/clear` 清空会话，`/quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use promptexec::config::{load_config, AppConfig};
use promptexec::core::{InvocationOutcome, PromptOrchestrator, RequestContext, SubmitHandle};
use promptexec::llm::create_client;
use promptexec::memory::{ConversationKey, InMemoryConversationStore};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    promptexec::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let (model, client) = create_client(&cfg.llm);
    let store = Arc::new(InMemoryConversationStore::new());
    let orchestrator = PromptOrchestrator::builder()
        .memory(store.clone())
        .system_prompt(cfg.app.resolve_system_prompt())
        .build();
    let key = ConversationKey::new();

    println!(
        "{} ({}) - type a prompt or /stop /history /clear /quit",
        cfg.app.name.as_deref().unwrap_or("promptexec"),
        model
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            // 在途调用的句柄会以 Skipped 结束并打印 (stopped)
            "/stop" => orchestrator.cancel_current(),
            "/clear" => {
                // 先取消在途调用，下一次提交会重新写入 system 消息
                orchestrator.cancel_current();
                store.clear(&key);
                println!("(cleared)");
            }
            "/history" => {
                for message in orchestrator.memory().read_all(&key) {
                    println!("[{:?}] {}", message.role, message.content);
                }
            }
            input => {
                let context = RequestContext::new(key.clone(), input, model.clone(), client.clone())
                    .with_timeout_secs(cfg.llm.timeout_secs);
                let handle = orchestrator.submit(context);
                tokio::spawn(report(handle));
            }
        }
    }

    Ok(())
}

/// 在后台等待结果并打印，主循环保持可输入 /stop
async fn report(handle: SubmitHandle) {
    match handle.wait().await {
        Ok(completion) => match completion.outcome {
            InvocationOutcome::Generated(reply) => {
                println!("{}", reply.message.content);
                println!("({} ms)", reply.elapsed.as_millis());
            }
            InvocationOutcome::Failed(err) => eprintln!("error: {}", err),
            InvocationOutcome::Skipped => println!("(stopped)"),
        },
        Err(err) => eprintln!("error: {}", err),
    }
}
