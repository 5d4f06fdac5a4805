//! State shared by every connection handler.

use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::config::{LimitsConfig, ProxyConfig, TimeoutConfig};
use crate::proto::ParserLimits;
use crate::upstream::Connector;

#[derive(Debug)]
pub struct ProxyContext {
    pub connector: Connector,
    /// `None` when caching is disabled.
    pub cache: Option<Arc<ResponseCache>>,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
}

impl ProxyContext {
    pub fn new(config: &ProxyConfig) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(&config.cache)));
        Self {
            connector: Connector::new(&config.upstream, &config.timeouts),
            cache,
            limits: config.limits.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits::from(&self.limits)
    }
}
