//! Built-in operations of the reference worker.
//!
//! Payloads are `{"op": "<name>", ...}`:
//!
//! | op      | fields                          | behaviour                                   |
//! |---------|---------------------------------|---------------------------------------------|
//! | `echo`  | `value`                         | completes with `value`                      |
//! | `sleep` | `ms`                            | sleeps, yielding to preemption              |
//! | `steps` | `count`, `step_ms`              | checkpointed loop, resumable after preempt  |
//! | `alloc` | `mb`, `hold_ms`                 | touches `mb` MiB and holds it               |
//! | `fail`  | `message`, `guard`              | reports failure, optionally for a guard     |
//! | `hang`  |                                 | never finishes and ignores preemption       |

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{TaskContext, TaskHandler};
use crate::task::Execution;

const MB: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    Echo {
        #[serde(default)]
        value: serde_json::Value,
    },
    Sleep {
        ms: u64,
    },
    Steps {
        count: u32,
        #[serde(default = "default_step_ms")]
        step_ms: u64,
    },
    Alloc {
        mb: usize,
        #[serde(default)]
        hold_ms: u64,
    },
    Fail {
        #[serde(default = "default_failure")]
        message: String,
        #[serde(default)]
        guard: Option<String>,
    },
    Hang,
}

fn default_step_ms() -> u64 {
    100
}

fn default_failure() -> String {
    "requested failure".to_string()
}

/// Handler backing the `warden-worker` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinOps;

#[async_trait]
impl TaskHandler for BuiltinOps {
    async fn run(&self, ctx: TaskContext) -> Execution {
        let op: Op = match serde_json::from_value(ctx.payload().clone()) {
            Ok(op) => op,
            Err(e) => {
                return Execution::Failed {
                    error: format!("bad payload: {e}"),
                    guard: None,
                };
            }
        };

        match op {
            Op::Echo { value } => Execution::Completed { result: value },
            Op::Sleep { ms } => {
                tokio::select! {
                    _ = ctx.preempted() => Execution::Preempted { checkpoint: None },
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        Execution::Completed { result: json!({"slept_ms": ms}) }
                    }
                }
            }
            Op::Steps { count, step_ms } => steps(&ctx, count, step_ms).await,
            Op::Alloc { mb, hold_ms } => alloc(&ctx, mb, hold_ms).await,
            Op::Fail { message, guard } => Execution::Failed {
                error: message,
                guard,
            },
            Op::Hang => std::future::pending().await,
        }
    }
}

async fn steps(ctx: &TaskContext, count: u32, step_ms: u64) -> Execution {
    let start = ctx
        .checkpoint()
        .and_then(|c| c.get("step"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;

    for step in start..count {
        if ctx.is_preempted() {
            return Execution::Preempted {
                checkpoint: Some(json!({"step": step})),
            };
        }
        tokio::select! {
            _ = ctx.preempted() => {
                return Execution::Preempted { checkpoint: Some(json!({"step": step})) };
            }
            _ = tokio::time::sleep(Duration::from_millis(step_ms)) => {}
        }
        ctx.report_progress(percent_done(step + 1, count), Some(json!({"step": step + 1})));
    }

    Execution::Completed {
        result: json!({"steps": count, "resumed_from": start}),
    }
}

fn percent_done(done: u32, count: u32) -> u8 {
    (u64::from(done) * 100 / u64::from(count.max(1))).min(100) as u8
}

async fn alloc(ctx: &TaskContext, mb: usize, hold_ms: u64) -> Execution {
    // Filled so every page is resident, not just reserved.
    let block = vec![0xA5u8; mb * MB];
    ctx.report_progress_with(50, block.len() as u64, None);

    tokio::select! {
        _ = ctx.preempted() => Execution::Preempted { checkpoint: None },
        _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => {
            Execution::Completed {
                result: json!({"allocated_mb": mb, "checksum": block.iter().step_by(MB).count()}),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::protocol::WorkerMessage;
    use crate::task::TaskId;

    fn context(
        payload: serde_json::Value,
        checkpoint: Option<serde_json::Value>,
    ) -> (TaskContext, CancellationToken, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (out, rx) = mpsc::unbounded_channel();
        let preempt = CancellationToken::new();
        let ctx = TaskContext {
            task_id: TaskId::new(),
            payload,
            checkpoint,
            soft_limit: 300 * MB as u64,
            preempt: preempt.clone(),
            advised: Arc::new(AtomicBool::new(false)),
            out,
        };
        (ctx, preempt, rx)
    }

    #[test]
    fn percent_done_handles_large_counts() {
        assert_eq!(percent_done(1, 4), 25);
        assert_eq!(percent_done(u32::MAX, u32::MAX), 100);
        assert_eq!(percent_done(50_000_000, 100_000_000), 50);
        assert_eq!(percent_done(0, 0), 0);
    }

    #[tokio::test]
    async fn echo_returns_value() {
        let (ctx, _, _) = context(json!({"op": "echo", "value": [1, 2]}), None);
        assert_eq!(
            BuiltinOps.run(ctx).await,
            Execution::Completed { result: json!([1, 2]) }
        );
    }

    #[tokio::test]
    async fn fail_carries_guard() {
        let (ctx, _, _) = context(json!({"op": "fail", "message": "503", "guard": "llm"}), None);
        assert_eq!(
            BuiltinOps.run(ctx).await,
            Execution::Failed {
                error: "503".into(),
                guard: Some("llm".into())
            }
        );
    }

    #[tokio::test]
    async fn unknown_op_fails() {
        let (ctx, _, _) = context(json!({"op": "launch"}), None);
        assert!(matches!(BuiltinOps.run(ctx).await, Execution::Failed { guard: None, .. }));
    }

    #[tokio::test]
    async fn steps_resume_from_checkpoint() {
        let (ctx, _, mut rx) = context(
            json!({"op": "steps", "count": 4, "step_ms": 1}),
            Some(json!({"step": 2})),
        );
        assert_eq!(
            BuiltinOps.run(ctx).await,
            Execution::Completed {
                result: json!({"steps": 4, "resumed_from": 2})
            }
        );
        let mut progress = 0;
        while let Ok(msg) = rx.try_recv() {
            assert!(matches!(msg, WorkerMessage::Progress { .. }));
            progress += 1;
        }
        assert_eq!(progress, 2);
    }

    #[tokio::test]
    async fn steps_checkpoint_on_preempt() {
        let (ctx, preempt, _rx) = context(json!({"op": "steps", "count": 100, "step_ms": 10_000}), None);
        let run = tokio::spawn(async move { BuiltinOps.run(ctx).await });
        preempt.cancel();
        assert_eq!(
            run.await.unwrap(),
            Execution::Preempted {
                checkpoint: Some(json!({"step": 0}))
            }
        );
    }

    #[tokio::test]
    async fn alloc_reports_its_size() {
        let (ctx, _, mut rx) = context(json!({"op": "alloc", "mb": 2}), None);
        assert!(BuiltinOps.run(ctx).await.eq(&Execution::Completed {
            result: json!({"allocated_mb": 2, "checksum": 2})
        }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkerMessage::Progress { memory_estimate, .. } if memory_estimate == 2 * MB as u64
        ));
    }
}
