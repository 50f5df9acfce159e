//! Capabilities shared by daemon resources, plus the concurrent hydration of
//! resource listings.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::Result;
use crate::sequencer::{Dispatch, TaskSequencer};

/// A resource addressed by name (or fingerprint, for images).
pub trait Named {
    fn name(&self) -> &str;

    /// Path of the resource below the API prefix, e.g. `/containers/web`.
    fn path(&self) -> String;
}

/// A resource whose local copy can be reloaded from the daemon.
#[async_trait]
pub trait Refresh {
    async fn refresh(&mut self) -> Result<()>;
}

/// Fetch every name concurrently, keeping listing order.
///
/// Names that fail to fetch are skipped; a child deleted between the listing
/// and its fetch must not fail the whole listing.
pub(crate) async fn hydrate<T, F, Fut>(names: Vec<String>, fetch: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let slots: Arc<Mutex<Vec<Option<T>>>> =
        Arc::new(Mutex::new((0..names.len()).map(|_| None).collect()));

    let sequencer = TaskSequencer::new();
    for (index, name) in names.into_iter().enumerate() {
        let slots = Arc::clone(&slots);
        let pending = fetch(name.clone());
        sequencer.queue_future(Dispatch::Eager, async move {
            match pending.await {
                Ok(item) => {
                    let mut slots = slots.lock().unwrap_or_else(|p| p.into_inner());
                    slots[index] = Some(item);
                }
                Err(e) => debug!(name = %name, error = %e, "Skipping resource that failed to load"),
            }
        });
    }
    sequencer.complete().await?;

    let mut slots = slots.lock().unwrap_or_else(|p| p.into_inner());
    Ok(std::mem::take(&mut *slots).into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LxdError;

    #[tokio::test]
    async fn test_hydrate_keeps_order_and_skips_failures() {
        let names = vec!["a".to_string(), "gone".to_string(), "c".to_string()];
        let items = hydrate(names, |name| async move {
            if name == "gone" {
                Err(LxdError::Remote {
                    message: "not found".into(),
                    status: "Not Found".into(),
                    code: 404,
                })
            } else {
                Ok(name.to_uppercase())
            }
        })
        .await
        .unwrap();
        assert_eq!(items, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_hydrate_empty_listing() {
        let items: Vec<String> = hydrate(Vec::new(), |name| async move { Ok(name) }).await.unwrap();
        assert!(items.is_empty());
    }
}
