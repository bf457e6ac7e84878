use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

/// Default wait before the non-streaming rescue fires.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(6);

/// Race the stream's first event against a timer. Any decoded event
/// before the timer fires settles the race in the stream's favor and the
/// supervisor exits without side effects. If the timer wins, `on_fire`
/// runs exactly once; there are no retries beyond it.
pub fn spawn_fallback<F, Fut>(
    first_event: Arc<Notify>,
    timeout: Duration,
    on_fire: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = first_event.notified() => {}
            _ = tokio::time::sleep(timeout) => {
                info!(timeout_ms = timeout.as_millis() as u64, "no stream event before timeout, firing fallback");
                on_fire().await;
            }
        }
    })
}
