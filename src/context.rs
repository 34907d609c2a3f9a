use crate::config::FetchConfig;
use crate::executor::Executor;
use crate::retry::{JitterSource, RandomJitter, RetryPolicy};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

type JitterFactory = Arc<dyn Fn() -> Box<dyn JitterSource> + Send + Sync>;

/// Everything a batch needs that outlives it: transport clients,
/// configuration and the jitter source for retry delays. Independent
/// contexts never share state.
#[derive(Clone)]
pub struct FetchContext {
    http: reqwest::Client,
    s3: Option<aws_sdk_s3::Client>,
    config: FetchConfig,
    jitter: JitterFactory,
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("config", &self.config)
            .field("s3", &self.s3.is_some())
            .finish()
    }
}

impl FetchContext {
    pub fn new(config: FetchConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: FetchConfig) -> Self {
        Self {
            http,
            s3: None,
            config,
            jitter: Arc::new(|| Box::new(RandomJitter::from_entropy()) as Box<dyn JitterSource>),
        }
    }

    /// Enables `s3://` hrefs.
    pub fn with_s3(mut self, client: aws_sdk_s3::Client) -> Self {
        self.s3 = Some(client);
        self
    }

    /// Replaces the jitter source, e.g. with a fixed one in tests.
    pub fn with_jitter<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn JitterSource> + Send + Sync + 'static,
    {
        self.jitter = Arc::new(factory);
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn executor(&self) -> Executor {
        Executor::new(
            self.http.clone(),
            self.s3.clone(),
            self.config.overwrite_policy,
            self.config.read_timeout(),
        )
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(&self.config, (self.jitter)())
    }
}
