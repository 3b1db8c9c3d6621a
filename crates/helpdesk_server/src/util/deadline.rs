#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use helpdesk_domain::ChatError;
use tracing::warn;

/// Run a store call under `limit`. Failures and timeouts become
/// `StoreUnavailable`.
pub async fn store_call<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, ChatError>
where
	F: Future<Output = anyhow::Result<T>>,
{
	match tokio::time::timeout(limit, fut).await {
		Ok(Ok(v)) => Ok(v),
		Ok(Err(e)) => {
			warn!(op, error = %format!("{e:#}"), "store call failed");
			metrics::counter!("helpdesk_server_store_errors_total", "op" => op).increment(1);
			Err(ChatError::store(format!("{op}: {e}")))
		}
		Err(_) => {
			warn!(op, timeout_ms = limit.as_millis() as u64, "store call timed out");
			metrics::counter!("helpdesk_server_store_timeouts_total", "op" => op).increment(1);
			Err(ChatError::store(format!("{op} timed out")))
		}
	}
}
