//! Panic containment for unattended work.
//!
//! Periodic and deferred tasks (pool validation, topology rediscovery) run on
//! shared scheduler threads. A panic in one of them must be logged and
//! swallowed, never unwind into the scheduler loop.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{CallerError, CallerResult};

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Run `f`, converting a panic into `CallerError::InternalBug`.
///
/// - `stage`: short label for the task (e.g. `"validate_pool"`)
/// - `ctx`: context injected into the error (e.g. `"pool=eis/a"`)
pub fn catch_task<T, F>(stage: &str, ctx: &str, f: F) -> CallerResult<T>
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                stage = stage,
                context = ctx,
                panic_message = %message,
                "panic caught at task boundary"
            );
            Err(CallerError::internal_bug(
                "E-TASK-001",
                format!("panic in stage '{}': {}", stage, message),
                ctx,
            ))
        }
    }
}

/// Run a fallible task and log any error or panic. Never propagates.
///
/// Returns true when the task completed without error.
pub fn run_guarded<F>(stage: &str, ctx: &str, f: F) -> bool
where
    F: FnOnce() -> CallerResult<()>,
{
    match catch_task(stage, ctx, f) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(stage = stage, context = ctx, error = %e, "background task failed");
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_task_ok() {
        assert_eq!(catch_task("stage", "ctx", || 42).unwrap(), 42);
    }

    #[test]
    fn test_catch_task_converts_panic() {
        let err = catch_task("validate_pool", "pool=eis/a", || -> u32 { panic!("boom") })
            .unwrap_err();
        assert!(err.is_internal_bug());
        let msg = err.to_string();
        assert!(msg.contains("boom"));
        assert!(msg.contains("pool=eis/a"));
    }

    #[test]
    fn test_run_guarded_swallows_errors_and_panics() {
        assert!(run_guarded("ok", "", || Ok(())));
        assert!(!run_guarded("err", "", || Err(CallerError::Internal("nope".into()))));
        assert!(!run_guarded("panic", "", || panic!("boom")));
    }
}
