use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    routing::post,
    Router,
};
use futures::Stream;
use serde::Deserialize;
use tracing::instrument;

use super::relay::relay;
use crate::{error::AppError, extract::AppJson, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

pub fn chat_routes() -> Router<AppState> {
    Router::new().route("/chat/stream", post(chat_stream))
}

#[instrument(skip(state, payload), fields(prompt_len = payload.text.len()))]
pub async fn chat_stream(
    State(state): State<AppState>,
    AppJson(payload): AppJson<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if payload.text.trim().is_empty() {
        return Err(AppError::validation("text", "Text is required"));
    }
    Ok(Sse::new(relay(state.llm.clone(), payload.text)))
}
