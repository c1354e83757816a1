use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};

use super::llm::{CompletionClient, FragmentStream};
use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Token(&'static str),
    Fail(&'static str),
}

/// Replays a fixed script of fragments and failures.
pub struct ScriptedClient {
    steps: Vec<Step>,
    open_error: Option<&'static str>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            open_error: None,
            prompts: Arc::default(),
        }
    }

    pub fn failing_to_open(message: &'static str) -> Self {
        Self {
            open_error: Some(message),
            ..Self::new(Vec::new())
        }
    }

    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        self.prompts.clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn stream(&self, prompt: &str) -> Result<FragmentStream, AppError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(msg) = self.open_error {
            return Err(AppError::Upstream(msg.into()));
        }
        let items: Vec<Result<String, AppError>> = self
            .steps
            .iter()
            .map(|s| match s {
                Step::Token(t) => Ok((*t).to_string()),
                Step::Fail(m) => Err(AppError::Upstream((*m).to_string())),
            })
            .collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

/// Hands out a stream fed by the test through a channel, one open only.
pub struct ChannelClient {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<String, AppError>>>>,
}

impl ChannelClient {
    pub fn channel() -> (Self, mpsc::UnboundedSender<Result<String, AppError>>) {
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl CompletionClient for ChannelClient {
    async fn stream(&self, _prompt: &str) -> Result<FragmentStream, AppError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AppError::Upstream("already opened".into()))?;
        Ok(rx.boxed())
    }
}
