use std::{convert::Infallible, sync::Arc};

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use tracing::{info, warn};

use super::llm::CompletionClient;

/// SSE cannot carry bare carriage returns.
fn sse_safe(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn fragment_event(text: &str) -> Event {
    Event::default().data(sse_safe(text))
}

fn error_event(message: &str) -> Event {
    Event::default().data(sse_safe(&format!("Error: {message}")))
}

/// Opens the upstream completion and yields one event per non-empty fragment,
/// in arrival order. Any upstream failure becomes a single terminal
/// `Error: <message>` event.
///
/// Dropping the returned stream (client disconnect) drops the upstream
/// response with it.
pub fn relay(
    client: Arc<dyn CompletionClient>,
    prompt: String,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        match client.stream(&prompt).await {
            Err(e) => {
                warn!(error = %e, "completion stream failed to open");
                yield Ok(error_event(&e.to_string()));
            }
            Ok(mut fragments) => {
                let mut forwarded = 0usize;
                while let Some(item) = fragments.next().await {
                    match item {
                        Ok(text) if text.is_empty() => {}
                        Ok(text) => {
                            forwarded += 1;
                            yield Ok(fragment_event(&text));
                        }
                        Err(e) => {
                            warn!(error = %e, forwarded, "completion stream failed");
                            yield Ok(error_event(&e.to_string()));
                            break;
                        }
                    }
                }
                info!(forwarded, "completion stream finished");
            }
        }
    }
}
