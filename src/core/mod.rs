//! 核心编排层：请求上下文、错误分类、单飞调用编排器

pub mod classifier;
pub mod context;
pub mod error;
pub mod orchestrator;

pub use classifier::classify;
pub use context::{Completion, GeneratedReply, InvocationOutcome, RequestContext};
pub use error::{InvocationFailure, PromptError, WorkerStopped, JAN_MODEL_NOT_ACTIVE};
pub use orchestrator::{OrchestratorBuilder, PromptOrchestrator, SubmitHandle, FORMATTING_SUFFIX};
