//! Resilience layer around backend calls: retry with backoff, quota
//! fallback and loop detection.

mod fallback;
mod loop_detection;
mod retry;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::Result;

pub use fallback::{ActiveModel, ModelSwitch};
pub use loop_detection::{LoopDetector, LoopKind};
pub use retry::RetryPolicy;

/// Successful result of [`call_with_fallback`].
#[derive(Debug)]
pub struct Resilient<T> {
    pub value: T,
    /// Model that produced `value`.
    pub model: String,
    pub switched: Option<ModelSwitch>,
}

/// Run `call` against the active model with retries; on a quota failure
/// switch to the fallback model once and start over with fresh attempts.
pub async fn call_with_fallback<T, F, Fut>(
    retry: &RetryPolicy,
    active: &mut ActiveModel,
    cancel: &CancellationToken,
    operation: &str,
    mut call: F,
) -> Result<Resilient<T>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut switched = None;
    loop {
        let model = active.current().to_string();
        match retry.run(cancel, operation, || call(model.clone())).await {
            Ok(value) => {
                return Ok(Resilient {
                    value,
                    model,
                    switched,
                })
            }
            Err(e) if e.is_quota() => match active.handle_quota() {
                Some(switch) => switched = Some(switch),
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
