//! Interceptor pipeline: ordered request and response hooks that observe and
//! mutate one exchange before it is forwarded or relayed.

pub mod codec;
pub mod debug;

use std::sync::Arc;

use async_trait::async_trait;

use crate::http1::{Request, Response};
use crate::telemetry::log::RequestLog;

pub use debug::DebugInterceptor;

/// A per-exchange hook. A plugin declares which phases it wants through the
/// capability probes; one plugin may take both, in which case it runs in both
/// phases at its registration position.
#[async_trait]
pub trait Interceptor: Send + Sync {
	fn name(&self) -> &'static str;

	fn handles_request(&self) -> bool {
		false
	}

	fn handles_response(&self) -> bool {
		false
	}

	async fn process_request(&self, _request: &mut Request, _log: &RequestLog) {}

	async fn process_response(&self, _response: &mut Response, _log: &RequestLog) {}
}

#[derive(Debug, thiserror::Error)]
#[error("interceptor {0:?} declares neither request nor response capability")]
pub struct InvalidInterceptor(pub &'static str);

/// Registration-ordered plugin lists. Mutated only during startup; the serve
/// path reads it behind an `Arc`.
#[derive(Default)]
pub struct InterceptorRegistry {
	request: Vec<Arc<dyn Interceptor>>,
	response: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, plugin: Arc<dyn Interceptor>) -> Result<(), InvalidInterceptor> {
		if !plugin.handles_request() && !plugin.handles_response() {
			return Err(InvalidInterceptor(plugin.name()));
		}
		if plugin.handles_request() {
			self.request.push(plugin.clone());
		}
		if plugin.handles_response() {
			self.response.push(plugin);
		}
		Ok(())
	}

	pub async fn run_request(&self, request: &mut Request, log: &RequestLog) {
		for plugin in &self.request {
			plugin.process_request(request, log).await;
		}
	}

	pub async fn run_response(&self, response: &mut Response, log: &RequestLog) {
		for plugin in &self.response {
			plugin.process_response(response, log).await;
		}
	}
}
