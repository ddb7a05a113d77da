//! 单飞调用编排器：每个会话一个实例
//!
//! submit 在互斥锁内完成簿记（检查 / 替换在途调用、写入 system 与 user 消息），随后把模型调用交给
//! 本实例独占的单个 worker 任务；worker 把调用放到阻塞线程池，用超时与取消令牌与之赛跑，结果回到锁内做身份校验后才写记忆。
//! 锁从不跨 `.await` 持有；输掉的调用在结果交付之后才被等待退出，因此挂起的后端既不会阻塞对它自身的取消，也不会推迟超时的上报。
//!
//! 去抖策略：已有调用在途时再次 submit 视为「停止」，取消旧调用且本次不做任何事（不排队）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::classifier::classify;
use crate::core::context::{Completion, GeneratedReply, InvocationOutcome, RequestContext};
use crate::core::error::{InvocationFailure, PromptError, WorkerStopped};
use crate::llm::{LlmClient, LlmError};
use crate::memory::{
    ConversationKey, ConversationMemory, DefaultComposer, InMemoryConversationStore, Message,
    MessageComposer,
};

/// 拼接在 system 提示词之后的固定格式要求
pub const FORMATTING_SUFFIX: &str = "\nAlways use markdown to format your answer. \
Use **bold** for important terms, `inline code` for identifiers and fenced code blocks \
with a language tag for source code.";

/// 在途调用的句柄；同一编排器任何时刻至多一个
struct PendingInvocation {
    id: u64,
    key: ConversationKey,
    user_message: Message,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    current: Option<PendingInvocation>,
    next_id: u64,
}

struct Job {
    id: u64,
    messages: Vec<Message>,
    cancel: CancellationToken,
    started: Instant,
    started_at: DateTime<Utc>,
    reply: Reply,
}

/// 结果投递：未显式交付就被丢弃（worker 退出、运行时关闭）时以 Skipped 交还上下文
struct Reply {
    inner: Option<(oneshot::Sender<Completion>, RequestContext)>,
}

impl Reply {
    fn new(tx: oneshot::Sender<Completion>, context: RequestContext) -> Self {
        Self {
            inner: Some((tx, context)),
        }
    }

    fn take(&mut self) -> Option<(oneshot::Sender<Completion>, RequestContext)> {
        self.inner.take()
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some((tx, context)) = self.inner.take() {
            let _ = tx.send(Completion {
                context,
                outcome: InvocationOutcome::Skipped,
            });
        }
    }
}

/// 在阻塞线程池上运行的模型调用；None 表示被 stop 令牌提前叫停
type CallHandle = JoinHandle<Option<Result<String, LlmError>>>;

/// 编排器与 worker 共享的状态
struct Shared {
    slot: Mutex<Slot>,
    running: AtomicBool,
    memory: Arc<dyn ConversationMemory>,
    composer: Arc<dyn MessageComposer>,
    system_prompt: String,
}

/// submit 返回的句柄，await `wait()` 得到 Completion
#[derive(Debug)]
pub struct SubmitHandle {
    rx: oneshot::Receiver<Completion>,
}

impl SubmitHandle {
    fn resolved(completion: Completion) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(completion);
        Self { rx }
    }

    /// 等待调用结束。排队中被丢弃的调用以 Skipped 结束；
    /// 只有 worker 正在处理时运行时被关闭，上下文随之丢失，才返回 WorkerStopped
    pub async fn wait(self) -> Result<Completion, WorkerStopped> {
        self.rx.await.map_err(|_| WorkerStopped)
    }
}

/// 单会话调用编排器
pub struct PromptOrchestrator {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl PromptOrchestrator {
    /// 创建编排器并启动其专属 worker；必须在 tokio 运行时内调用
    pub fn new(
        memory: Arc<dyn ConversationMemory>,
        composer: Arc<dyn MessageComposer>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            running: AtomicBool::new(false),
            memory,
            composer,
            system_prompt: system_prompt.into(),
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(shared.clone(), rx));
        Self { shared, jobs }
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn memory(&self) -> Arc<dyn ConversationMemory> {
        self.shared.memory.clone()
    }

    /// 是否有调用在途（驱动 UI 的「发送 / 停止」切换）
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// 取消在途调用并撤销其 User 消息；幂等
    pub fn cancel_current(&self) {
        let mut slot = self.shared.lock_slot();
        if let Some(pending) = slot.current.take() {
            self.shared.abandon(pending);
        }
    }

    /// 提交一次请求
    pub fn submit(&self, mut context: RequestContext) -> SubmitHandle {
        tracing::debug!(
            conversation = %context.key,
            model = %context.model,
            "Submitting prompt"
        );

        let mut slot = self.shared.lock_slot();

        if let Some(prior) = slot.current.take() {
            self.shared.abandon(prior);
            return SubmitHandle::resolved(Completion {
                context,
                outcome: InvocationOutcome::Skipped,
            });
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let memory = &self.shared.memory;
        let key = context.key.clone();
        if memory.is_empty(&key) && context.model.accepts_system_message() {
            tracing::debug!(conversation = %key, "Conversation is empty, adding system message");
            memory.append(
                &key,
                Message::system(format!("{}{}", self.shared.system_prompt, FORMATTING_SUFFIX)),
            );
        }

        let user_message = self
            .shared
            .composer
            .compose_user_message(&context.user_input, &context.attachments);
        memory.append(&key, user_message.clone());

        let started = Instant::now();
        let started_at = Utc::now();
        context.elapsed = None;

        slot.next_id += 1;
        let id = slot.next_id;
        let cancel = CancellationToken::new();
        let messages = memory.read_all(&key);
        slot.current = Some(PendingInvocation {
            id,
            key,
            user_message,
            cancel: cancel.clone(),
        });

        let (reply_tx, rx) = oneshot::channel();
        let job = Job {
            id,
            messages,
            cancel,
            started,
            started_at,
            reply: Reply::new(reply_tx, context),
        };

        if let Err(mpsc::error::SendError(mut job)) = self.jobs.send(job) {
            // worker 已退出：按后端失败走分类与回滚
            if let Some((reply_tx, mut context)) = job.reply.take() {
                let failure = InvocationFailure::Provider(LlmError::Aborted(
                    "prompt worker is not running".to_string(),
                ));
                let outcome =
                    self.shared
                        .settle(&mut slot, job.id, &mut context, Err(failure), job.started);
                drop(slot);
                let _ = reply_tx.send(Completion { context, outcome });
            }
        }

        SubmitHandle { rx }
    }
}

impl Drop for PromptOrchestrator {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 放弃一个在途调用：触发取消令牌、撤销 User 消息、清除运行标志。调用方需持有 slot 锁
    fn abandon(&self, pending: PendingInvocation) {
        pending.cancel.cancel();
        self.rollback(&pending);
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(conversation = %pending.key, "Cancelled running prompt");
    }

    /// 只撤销本次写入的 User 消息
    fn rollback(&self, pending: &PendingInvocation) {
        let last = self.memory.read_all(&pending.key).pop();
        if last.as_ref() == Some(&pending.user_message) {
            self.memory.remove_last(&pending.key);
        } else {
            tracing::warn!(
                conversation = %pending.key,
                "Last message is not the pending user message, skipping rollback"
            );
        }
    }

    /// worker 结果落地：仍是当前调用才写记忆，否则静默丢弃
    fn settle(
        &self,
        slot: &mut Slot,
        id: u64,
        context: &mut RequestContext,
        result: Result<String, InvocationFailure>,
        started: Instant,
    ) -> InvocationOutcome {
        let pending = match slot.current.take() {
            Some(p) if p.id == id => p,
            other => {
                slot.current = other;
                tracing::debug!(conversation = %context.key, "Discarding superseded result");
                return InvocationOutcome::Skipped;
            }
        };
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok(content) => {
                let elapsed = started.elapsed();
                context.elapsed = Some(elapsed);
                let message = Message::assistant(content);
                self.memory.append(&pending.key, message.clone());
                InvocationOutcome::Generated(GeneratedReply { message, elapsed })
            }
            Err(failure) => {
                let err = classify(&failure, context.model.provider);
                if err.rolls_back_memory() {
                    self.rollback(&pending);
                }
                if err.is_reportable() {
                    tracing::error!(
                        conversation = %pending.key,
                        "Error occurred while processing chat message: {} ({})",
                        err,
                        failure
                    );
                    InvocationOutcome::Failed(err)
                } else {
                    InvocationOutcome::Skipped
                }
            }
        }
    }

    async fn process(&self, mut job: Job) {
        let Some((reply_tx, mut context)) = job.reply.take() else {
            return;
        };

        let secs = context.effective_timeout_secs();
        let (result, abandoned) =
            invoke(context.client.clone(), job.messages, secs, &job.cancel).await;

        let outcome = {
            let mut slot = self.lock_slot();
            self.settle(&mut slot, job.id, &mut context, result, job.started)
        };

        let label = match &outcome {
            InvocationOutcome::Generated(_) => "ok",
            InvocationOutcome::Failed(PromptError::Timeout { .. }) => "timeout",
            InvocationOutcome::Failed(_) => "error",
            InvocationOutcome::Skipped => "skipped",
        };
        let duration_ms = job.started.elapsed().as_millis() as u64;
        let (prompt_tokens, completion_tokens, total_tokens) = context.client.token_usage();
        let audit = serde_json::json!({
            "event": "prompt_audit",
            "conversation": context.key.as_str(),
            "provider": context.model.provider.name(),
            "model": context.model.model_name,
            "outcome": label,
            "duration_ms": duration_ms,
            "started_at": job.started_at.to_rfc3339(),
            "tokens": {
                "prompt": prompt_tokens,
                "completion": completion_tokens,
                "total": total_tokens,
            },
        });
        tracing::info!(audit = %audit.to_string(), "prompt");

        let _ = reply_tx.send(Completion { context, outcome });

        // 先交付结果再等输掉的调用退出，下一个调用开始前它已结束
        if let Some(call) = abandoned {
            if call.await.is_err() {
                tracing::debug!("Abandoned model call ended abnormally");
            }
        }
    }
}

/// 专属 worker：逐个处理调用；编排器释放发送端后退出
async fn run_worker(shared: Arc<Shared>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        shared.process(job).await;
    }
    tracing::debug!("Prompt worker stopped");
}

/// 把调用放到阻塞线程池：不让出执行权的后端也占不住运行时的工作线程
fn dispatch(
    client: Arc<dyn LlmClient>,
    messages: Vec<Message>,
    stop: CancellationToken,
) -> CallHandle {
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || {
        runtime.block_on(async move {
            tokio::select! {
                reply = client.complete(&messages) => Some(reply),
                _ = stop.cancelled() => None,
            }
        })
    })
}

/// 调用与截止计时器、取消令牌赛跑。输了立即返回失败，并交出仍在收尾的调用句柄
async fn invoke(
    client: Arc<dyn LlmClient>,
    messages: Vec<Message>,
    secs: u64,
    cancel: &CancellationToken,
) -> (Result<String, InvocationFailure>, Option<CallHandle>) {
    if cancel.is_cancelled() {
        return (Err(InvocationFailure::Cancelled), None);
    }

    let stop = CancellationToken::new();
    let mut call = dispatch(client, messages, stop.clone());
    let deadline = tokio::time::sleep(Duration::from_secs(secs));
    let lost = tokio::select! {
        joined = &mut call => {
            let result = match joined {
                Ok(Some(reply)) => reply.map_err(InvocationFailure::from),
                Ok(None) => Err(InvocationFailure::Cancelled),
                Err(join_err) => Err(InvocationFailure::Provider(LlmError::Aborted(
                    join_err.to_string(),
                ))),
            };
            return (result, None);
        }
        _ = cancel.cancelled() => InvocationFailure::Cancelled,
        _ = deadline => InvocationFailure::Timeout { secs },
    };

    stop.cancel();
    (Err(lost), Some(call))
}

/// 编排器构建器：未指定时使用进程内存储与默认组装器
pub struct OrchestratorBuilder {
    memory: Option<Arc<dyn ConversationMemory>>,
    composer: Option<Arc<dyn MessageComposer>>,
    system_prompt: String,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            memory: None,
            composer: None,
            system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}

impl OrchestratorBuilder {
    pub fn memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn composer(mut self, composer: Arc<dyn MessageComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn build(self) -> PromptOrchestrator {
        PromptOrchestrator::new(
            self.memory
                .unwrap_or_else(|| Arc::new(InMemoryConversationStore::new())),
            self.composer.unwrap_or_else(|| Arc::new(DefaultComposer)),
            self.system_prompt,
        )
    }
}
