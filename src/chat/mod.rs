use crate::state::AppState;
use axum::Router;

#[cfg(test)]
pub mod fake;
pub mod handlers;
pub mod llm;
mod relay;

pub fn router() -> Router<AppState> {
    handlers::chat_routes()
}
