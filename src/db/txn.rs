use crate::context::OpContext;
use crate::db::store::{MetadataStore, UnitOfWork};
use crate::error::{Result, TempDbError};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use tracing::warn;

/// Execute `f` within a single unit of work.
///
/// Commits when `f` returns `Ok`. Rolls back when `f` returns `Err`, when the
/// context is cancelled or times out, or when `f` panics; a panic resumes
/// after the rollback. The unit of work must not escape `f`, and nesting is
/// not supported.
///
/// `begin` and `f` are bounded by `ctx`; `commit` is not. A commit abandoned
/// halfway leaves its outcome unknown, so it always runs to completion.
pub async fn transaction<S, T, F>(store: &S, ctx: &OpContext, f: F) -> Result<T>
where
    S: MetadataStore,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T>>,
{
    let mut tx = ctx.run(store.begin()).await??;

    let outcome = ctx.run(AssertUnwindSafe(f(&mut tx)).catch_unwind()).await;

    match outcome {
        Ok(Ok(Ok(value))) => {
            tx.commit()
                .await
                .map_err(|e| TempDbError::Commit(Box::new(e)))?;
            Ok(value)
        }
        Ok(Ok(Err(err))) => {
            rollback_quietly(tx, "error").await;
            Err(err)
        }
        Ok(Err(panic)) => {
            rollback_quietly(tx, "panic").await;
            std::panic::resume_unwind(panic)
        }
        Err(ctx_err) => {
            rollback_quietly(tx, "context").await;
            Err(ctx_err)
        }
    }
}

// Best-effort rollback; the original failure is what the caller sees.
async fn rollback_quietly<U: UnitOfWork>(tx: U, cause: &'static str) {
    if let Err(e) = tx.rollback().await {
        warn!(cause, error = %e, "rollback failed");
    }
}
