//! 编排器集成测试：单飞、去抖取消、超时、回滚与错误分类

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use promptexec::core::{
    InvocationOutcome, PromptError, PromptOrchestrator, RequestContext, JAN_MODEL_NOT_ACTIVE,
};
use promptexec::llm::{LanguageModel, LlmClient, LlmError, MockLlmClient, ModelProvider};
use promptexec::memory::{
    Attachment, ConversationKey, ConversationMemory, InMemoryConversationStore, Message, Role,
};

/// 固定延迟后返回预设结果，并记录并发调用峰值
struct ScriptedClient {
    delay: Duration,
    result: Result<String, LlmError>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    finished: AtomicBool,
}

impl ScriptedClient {
    fn new(delay: Duration, result: Result<String, LlmError>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            result,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        })
    }

    fn ok(delay_ms: u64, reply: &str) -> Arc<Self> {
        Self::new(Duration::from_millis(delay_ms), Ok(reply.to_string()))
    }

    fn failing(message: &str) -> Arc<Self> {
        Self::new(Duration::ZERO, Err(LlmError::Request(message.to_string())))
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        self.result.clone()
    }
}

/// 调用被中止（future 被丢弃）时也要减计数
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 直到 open() 才返回
#[derive(Default)]
struct GatedClient {
    gate: Notify,
}

impl GatedClient {
    fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl LlmClient for GatedClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.gate.notified().await;
        Ok("released".to_string())
    }
}

/// 同步阻塞线程的后端，期间从不让出执行权
struct BlockingClient {
    delay: Duration,
}

#[async_trait]
impl LlmClient for BlockingClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        std::thread::sleep(self.delay);
        Ok("blocked reply".to_string())
    }
}

struct PanickingClient;

#[async_trait]
impl LlmClient for PanickingClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        panic!("provider blew up");
    }
}

fn setup() -> (PromptOrchestrator, Arc<InMemoryConversationStore>) {
    let store = Arc::new(InMemoryConversationStore::new());
    let orchestrator = PromptOrchestrator::builder()
        .memory(store.clone())
        .system_prompt("You are a test assistant.")
        .build();
    (orchestrator, store)
}

fn mock_model() -> LanguageModel {
    LanguageModel::new(ModelProvider::Ollama, "llama3")
}

fn request(key: &ConversationKey, input: &str, client: Arc<dyn LlmClient>) -> RequestContext {
    RequestContext::new(key.clone(), input, mock_model(), client)
}

/// 预置一段已有对话
fn seed(store: &InMemoryConversationStore, key: &ConversationKey) -> Vec<Message> {
    store.append(key, Message::system("seeded system"));
    store.append(key, Message::user("earlier question"));
    store.append(key, Message::assistant("earlier answer"));
    store.read_all(key)
}

#[tokio::test]
async fn test_healthy_provider_on_empty_conversation() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("scenario-a");

    let completion = orchestrator
        .submit(request(&key, "Hello", Arc::new(MockLlmClient)))
        .wait()
        .await
        .unwrap();

    let reply = completion.outcome.reply().expect("expected a generated reply").clone();
    assert_eq!(reply.message, Message::assistant("Echo from Mock: Hello"));
    assert_eq!(completion.context.elapsed, Some(reply.elapsed));
    assert!(!orchestrator.is_running());

    let history = store.read_all(&key);
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].role, Role::System);
    assert!(history[0].content.starts_with("You are a test assistant."));
    assert_eq!(history[1], Message::user("Hello"));
    assert_eq!(history[2], reply.message);
}

#[tokio::test]
async fn test_generic_failure_rolls_back_user_message() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("scenario-b");
    let before = seed(&store, &key);

    let completion = orchestrator
        .submit(request(&key, "Follow up", ScriptedClient::failing("connection reset")))
        .wait()
        .await
        .unwrap();

    assert_eq!(
        completion.outcome,
        InvocationOutcome::Failed(PromptError::ProviderUnavailable("connection reset".to_string()))
    );
    assert!(completion.context.elapsed.is_none());
    assert_eq!(store.read_all(&key), before);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_resubmission_cancels_running_request() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("scenario-c");
    let before = seed(&store, &key);
    let gated = Arc::new(GatedClient::default());

    let first = orchestrator.submit(request(&key, "first", gated.clone()));
    assert!(orchestrator.is_running());
    assert_eq!(store.read_all(&key).last(), Some(&Message::user("first")));

    let second = orchestrator
        .submit(request(&key, "second", Arc::new(MockLlmClient)))
        .wait()
        .await
        .unwrap();
    assert!(second.outcome.is_skipped());
    assert!(!orchestrator.is_running());

    let first = first.wait().await.unwrap();
    assert!(first.outcome.is_skipped());
    assert!(first.context.elapsed.is_none());
    assert_eq!(store.read_all(&key), before);

    // 放行已被取消的调用也不会写入任何东西
    gated.open();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.read_all(&key), before);

    let third = orchestrator
        .submit(request(&key, "third", Arc::new(MockLlmClient)))
        .wait()
        .await
        .unwrap();
    assert!(third.outcome.reply().is_some());

    let history = store.read_all(&key);
    assert_eq!(history.len(), before.len() + 2);
    assert_eq!(history[before.len()], Message::user("third"));
    assert_eq!(history[before.len() + 1].role, Role::Assistant);
}

#[tokio::test]
async fn test_inactive_jan_model() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("scenario-d");
    let jan = LanguageModel::new(ModelProvider::Jan, "mistral-ins-7b-q4");

    let completion = orchestrator
        .submit(RequestContext::new(
            key.clone(),
            "Hi Jan",
            jan,
            ScriptedClient::failing("error sending request for url (http://localhost:1337/v1)"),
        ))
        .wait()
        .await
        .unwrap();

    assert_eq!(
        completion.outcome.error(),
        Some(&PromptError::ModelNotActive(JAN_MODEL_NOT_ACTIVE.to_string()))
    );
    let history = store.read_all(&key);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::System);
}

#[tokio::test]
async fn test_timeout_suppresses_late_result() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("timeout");
    let before = seed(&store, &key);
    let slow = ScriptedClient::ok(3_000, "too late");

    let completion = orchestrator
        .submit(request(&key, "slow one", slow.clone()).with_timeout_secs(1))
        .wait()
        .await
        .unwrap();

    assert_eq!(
        completion.outcome,
        InvocationOutcome::Failed(PromptError::Timeout { secs: 1 })
    );
    assert_eq!(store.read_all(&key), before);
    assert!(!orchestrator.is_running());

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(!slow.finished.load(Ordering::SeqCst));
    assert_eq!(store.read_all(&key), before);
}

#[tokio::test]
async fn test_system_message_primed_once() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("priming");

    orchestrator
        .submit(request(&key, "one", Arc::new(MockLlmClient)))
        .wait()
        .await
        .unwrap();
    orchestrator
        .submit(request(&key, "two", ScriptedClient::failing("boom")))
        .wait()
        .await
        .unwrap();
    orchestrator
        .submit(request(&key, "three", Arc::new(MockLlmClient)))
        .wait()
        .await
        .unwrap();

    let history = store.read_all(&key);
    let systems = history.iter().filter(|m| m.role == Role::System).count();
    assert_eq!(systems, 1);
    assert_eq!(history[0].role, Role::System);
    let users: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["one", "three"]);
}

#[tokio::test]
async fn test_failed_first_turn_does_not_reprime() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("reprime");

    orchestrator
        .submit(request(&key, "fails", ScriptedClient::failing("down")))
        .wait()
        .await
        .unwrap();
    assert_eq!(store.len(&key), 1);

    orchestrator
        .submit(request(&key, "works", Arc::new(MockLlmClient)))
        .wait()
        .await
        .unwrap();
    let roles: Vec<Role> = store.read_all(&key).into_iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
}

#[tokio::test]
async fn test_cancel_current_rolls_back_and_is_idempotent() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("cancel");
    let before = seed(&store, &key);

    let handle = orchestrator.submit(request(&key, "never answered", Arc::new(GatedClient::default())));
    assert!(orchestrator.is_running());

    orchestrator.cancel_current();
    assert!(!orchestrator.is_running());
    orchestrator.cancel_current();

    let completion = handle.wait().await.unwrap();
    assert!(completion.outcome.is_skipped());
    assert_eq!(store.read_all(&key), before);
}

#[tokio::test]
async fn test_running_flag_follows_lifecycle() {
    let (orchestrator, _store) = setup();
    let key = ConversationKey::from("running");
    let gated = Arc::new(GatedClient::default());

    assert!(!orchestrator.is_running());
    let handle = orchestrator.submit(request(&key, "wait for it", gated.clone()));
    assert!(orchestrator.is_running());

    gated.open();
    let completion = handle.wait().await.unwrap();
    assert_eq!(
        completion.outcome.reply().map(|r| r.message.content.as_str()),
        Some("released")
    );
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_elapsed_covers_call_duration() {
    let (orchestrator, _store) = setup();
    let key = ConversationKey::from("latency");

    let completion = orchestrator
        .submit(request(&key, "measure", ScriptedClient::ok(50, "done")))
        .wait()
        .await
        .unwrap();

    let elapsed = completion.context.elapsed.expect("elapsed set on success");
    assert!(elapsed >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_panicking_provider_is_classified() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("panic");
    let before = seed(&store, &key);

    let completion = orchestrator
        .submit(request(&key, "explode", Arc::new(PanickingClient)))
        .wait()
        .await
        .unwrap();

    assert!(matches!(
        completion.outcome,
        InvocationOutcome::Failed(PromptError::ProviderUnavailable(_))
    ));
    assert_eq!(store.read_all(&key), before);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_attachments_are_part_of_user_message() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("attachments");

    orchestrator
        .submit(
            request(&key, "Review this", Arc::new(MockLlmClient))
                .with_attachments(vec![Attachment::new("main.rs", "fn main() {}")]),
        )
        .wait()
        .await
        .unwrap();

    let user = &store.read_all(&key)[1];
    assert_eq!(user.role, Role::User);
    assert!(user.content.starts_with("Review this"));
    assert!(user.content.contains("fn main() {}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_stay_single_flight() {
    let (orchestrator, store) = setup();
    let orchestrator = Arc::new(orchestrator);
    let key = ConversationKey::from("concurrent");
    let client = ScriptedClient::ok(20, "reply");

    let mut tasks = Vec::new();
    for i in 0..16 {
        let orchestrator = orchestrator.clone();
        let key = key.clone();
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(i * 7)).await;
            orchestrator
                .submit(request(&key, &format!("msg {i}"), client))
                .wait()
                .await
                .unwrap()
                .outcome
        }));
    }

    let mut generated = 0;
    for task in tasks {
        match task.await.unwrap() {
            InvocationOutcome::Generated(_) => generated += 1,
            InvocationOutcome::Skipped => {}
            InvocationOutcome::Failed(e) => panic!("unexpected failure: {e}"),
        }
    }

    assert!(client.max_in_flight.load(Ordering::SeqCst) <= 1);
    assert!(!orchestrator.is_running());

    // 每条保留下来的 User 消息后面紧跟其回复
    let history = store.read_all(&key);
    assert_eq!(history[0].role, Role::System);
    let turns = &history[1..];
    assert_eq!(turns.len(), generated * 2);
    for pair in turns.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_provider_times_out_on_schedule() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("blocking-timeout");
    let before = seed(&store, &key);
    let client = Arc::new(BlockingClient {
        delay: Duration::from_secs(3),
    });

    let started = Instant::now();
    let completion = orchestrator
        .submit(request(&key, "stuck", client).with_timeout_secs(1))
        .wait()
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(2_000));
    assert_eq!(
        completion.outcome,
        InvocationOutcome::Failed(PromptError::Timeout { secs: 1 })
    );
    assert_eq!(store.read_all(&key), before);
    assert!(!orchestrator.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_resolves_while_blocking_provider_runs() {
    let (orchestrator, store) = setup();
    let key = ConversationKey::from("blocking-cancel");
    let before = seed(&store, &key);
    let client = Arc::new(BlockingClient {
        delay: Duration::from_secs(3),
    });

    let handle = orchestrator.submit(request(&key, "stuck", client));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    orchestrator.cancel_current();
    let completion = handle.wait().await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert!(completion.outcome.is_skipped());
    assert_eq!(store.read_all(&key), before);
    assert!(!orchestrator.is_running());

    // 下一次调用等阻塞的旧调用退出后照常完成
    let next = orchestrator
        .submit(request(&key, "again", Arc::new(MockLlmClient)))
        .wait()
        .await
        .unwrap();
    assert_eq!(
        next.outcome.reply().map(|r| r.message.clone()),
        Some(Message::assistant("Echo from Mock: again"))
    );
}
