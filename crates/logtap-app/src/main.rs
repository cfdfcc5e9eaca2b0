use std::sync::Arc;

use anyhow::Context;
use logtap::Config;
use logtap::Proxy;
use logtap::intercept::{DebugInterceptor, InterceptorRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::load().context("loading configuration")?;
	let app_log = config.app.app_log()?;
	logtap::telemetry::setup_logging(&app_log.level);

	let mut registry = InterceptorRegistry::new();
	registry.register(Arc::new(DebugInterceptor::new()))?;

	let proxy = Proxy::new(&config, registry).await?;
	tracing::info!(addr = %proxy.local_addr()?, "proxy listening");

	println!("Proxy server Started");
	proxy
		.serve(async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await;
	println!("Proxy server Disconnected");
	Ok(())
}
