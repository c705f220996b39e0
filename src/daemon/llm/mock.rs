//! Scripted engine for tests.

use super::{InferenceEngine, TokenSink};
use crate::config::GenerationConfig;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct MockModel {
    pub name: String,
}

#[derive(Debug)]
pub struct MockTokenizer;

/// Engine that replays fixed fragments and records what it was asked to do.
#[derive(Default)]
pub struct MockEngine {
    fragments: Vec<String>,
    failing_models: HashSet<String>,
    load_delay: Duration,
    fragment_delay: Duration,
    linger: Duration,
    fail_after: Option<usize>,
    fail_encode: bool,
    loads: AtomicUsize,
    released: Mutex<Vec<String>>,
    configs: Mutex<Vec<GenerationConfig>>,
}

impl MockEngine {
    pub fn new<S: Into<String>>(fragments: impl IntoIterator<Item = S>) -> Self {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn failing_model(mut self, name: &str) -> Self {
        self.failing_models.insert(name.to_string());
        self
    }

    pub fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Keep the decode call running this long after closing the sink.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Raise an error after pushing `n` fragments.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn fail_encode(mut self) -> Self {
        self.fail_encode = true;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    pub fn configs(&self) -> Vec<GenerationConfig> {
        self.configs.lock().clone()
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    type Model = MockModel;
    type Tokenizer = MockTokenizer;
    type Input = String;

    async fn load(&self, name: &str) -> Result<(MockModel, MockTokenizer)> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.failing_models.contains(name) {
            bail!("no such model: {}", name);
        }
        Ok((
            MockModel {
                name: name.to_string(),
            },
            MockTokenizer,
        ))
    }

    fn encode(&self, _tokenizer: &MockTokenizer, text: &str) -> Result<String> {
        if self.fail_encode {
            bail!("tokenizer rejected input");
        }
        Ok(text.to_string())
    }

    async fn generate(
        &self,
        _model: &MockModel,
        _input: String,
        config: &GenerationConfig,
        sink: TokenSink,
    ) -> Result<()> {
        self.configs.lock().push(config.clone());
        for (i, fragment) in self.fragments.iter().enumerate() {
            if self.fail_after == Some(i) {
                return Err(anyhow!("device lost during decode"));
            }
            if !self.fragment_delay.is_zero() {
                tokio::time::sleep(self.fragment_delay).await;
            }
            if sink.push(fragment.clone()).await.is_err() {
                return Ok(());
            }
        }
        if self.fail_after == Some(self.fragments.len()) {
            return Err(anyhow!("device lost during decode"));
        }
        drop(sink);
        if !self.linger.is_zero() {
            tokio::time::sleep(self.linger).await;
        }
        Ok(())
    }

    async fn release(&self, model: &MockModel) -> Result<()> {
        self.released.lock().push(model.name.clone());
        Ok(())
    }
}
