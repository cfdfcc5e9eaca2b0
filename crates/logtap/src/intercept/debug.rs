//! Reference interceptor: writes the full decoded exchange to the
//! per-request log.

use async_trait::async_trait;
use bytes::Bytes;

use crate::http1::{Headers, Request, Response};
use crate::intercept::codec::{self, ContentEncoding};
use crate::intercept::Interceptor;
use crate::telemetry::log::RequestLog;

type ModifyHook = dyn Fn(&[u8]) -> Bytes + Send + Sync;

/// Logs request and response verbatim, transcoding compressed response
/// bodies so the log holds the decoded payload.
#[derive(Default)]
pub struct DebugInterceptor {
	/// Extension point invoked with the decoded response body before
	/// re-encoding. The pipeline currently ignores the returned bytes and
	/// re-encodes the decoded body unchanged.
	pub modify_response: Option<Box<ModifyHook>>,
}

impl DebugInterceptor {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Interceptor for DebugInterceptor {
	fn name(&self) -> &'static str {
		"DebugInterceptor"
	}

	fn handles_request(&self) -> bool {
		true
	}

	fn handles_response(&self) -> bool {
		true
	}

	async fn process_request(&self, request: &mut Request, log: &RequestLog) {
		log.info("");
		log.info(request.title());
		log.info(format_headers(&request.headers));
		log.info(String::from_utf8_lossy(&request.body));
		log.info("");
	}

	async fn process_response(&self, response: &mut Response, log: &RequestLog) {
		log.info(response.title());
		log.info(format_headers(&response.headers));

		let header_value = response
			.headers
			.get("Content-Encoding")
			.unwrap_or("")
			.to_string();
		let Some(encoding) = ContentEncoding::parse(&header_value) else {
			log.warn(format!(
				"No compression or unsupported encoding. - {header_value}"
			));
			log.debug(String::from_utf8_lossy(&response.body));
			return;
		};

		// A codec failure never aborts the exchange: the body keeps the last
		// good bytes and Content-Length stays in sync with them.
		let decoded = match codec::decompress(&response.body, encoding).await {
			Ok(transcoded) => {
				log.debug(format!(
					"Decompressed ({encoding}):\n{}",
					String::from_utf8_lossy(&transcoded.data)
				));
				if let Some(warning) = transcoded.warning {
					log.warn(warning);
				}
				transcoded.data
			},
			Err(e) => {
				log.error(e.to_string());
				return;
			},
		};

		if let Some(hook) = &self.modify_response {
			let _ = hook(&decoded);
		}

		match codec::compress(&decoded, encoding).await {
			Ok(transcoded) => {
				log.debug(format!("Compressed ({encoding}): {} bytes", transcoded.data.len()));
				if let Some(warning) = transcoded.warning {
					log.warn(warning);
				}
				response.body = transcoded.data;
				response
					.headers
					.set("Content-Length", response.body.len().to_string());
			},
			Err(e) => {
				log.error(e.to_string());
			},
		}
	}
}

fn format_headers(headers: &Headers) -> String {
	let mut out = String::new();
	for (name, value) in headers.iter() {
		out.push_str(name);
		out.push_str(": ");
		out.push_str(value);
		out.push('\n');
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use tracing::Level;
	use uuid::Uuid;

	fn test_log(dir: &tempfile::TempDir) -> RequestLog {
		RequestLog::create(dir.path(), Uuid::new_v4(), Level::DEBUG).unwrap()
	}

	fn gzip_response(body: &[u8]) -> Response {
		Response {
			version: "HTTP/1.1".to_string(),
			status: 200,
			reason: "OK".to_string(),
			headers: Headers::from_iter([
				("Content-Encoding", "gzip".to_string()),
				("Content-Length", body.len().to_string()),
			]),
			body: Bytes::copy_from_slice(body),
		}
	}

	#[tokio::test]
	async fn transcodes_gzip_and_resyncs_content_length() {
		let dir = tempfile::tempdir().unwrap();
		let log = test_log(&dir);
		let payload = br#"{"a":1}"#;
		let packed = codec::compress(payload, ContentEncoding::Gzip).await.unwrap();
		let mut response = gzip_response(&packed.data);

		let plugin = DebugInterceptor::new();
		plugin.process_response(&mut response, &log).await;
		log.flush();

		assert_eq!(response.headers.get("Content-Encoding"), Some("gzip"));
		assert_eq!(
			response.headers.content_length(),
			Some(response.body.len())
		);
		let unpacked = codec::decompress(&response.body, ContentEncoding::Gzip)
			.await
			.unwrap();
		assert_eq!(&unpacked.data[..], payload);

		let logged = std::fs::read_to_string(log.path()).unwrap();
		assert!(logged.contains(r#"{"a":1}"#), "decoded payload is logged");
	}

	#[tokio::test]
	async fn corrupt_body_is_kept_as_is() {
		let dir = tempfile::tempdir().unwrap();
		let log = test_log(&dir);
		let mut response = gzip_response(b"this is not gzip at all");
		let original_body = response.body.clone();

		let plugin = DebugInterceptor::new();
		plugin.process_response(&mut response, &log).await;
		log.flush();

		assert_eq!(response.body, original_body);
		assert_eq!(
			response.headers.content_length(),
			Some(response.body.len())
		);
		let logged = std::fs::read_to_string(log.path()).unwrap();
		assert!(logged.contains("decompression failed"));
	}

	#[tokio::test]
	async fn unknown_encoding_passes_through_with_warning() {
		let dir = tempfile::tempdir().unwrap();
		let log = test_log(&dir);
		let mut response = Response {
			version: "HTTP/1.1".to_string(),
			status: 200,
			reason: "OK".to_string(),
			headers: Headers::from_iter([("Content-Encoding", "zstd")]),
			body: Bytes::from_static(b"opaque"),
		};

		let plugin = DebugInterceptor::new();
		plugin.process_response(&mut response, &log).await;
		log.flush();

		assert_eq!(&response.body[..], b"opaque");
		let logged = std::fs::read_to_string(log.path()).unwrap();
		assert!(logged.contains("unsupported encoding"));
	}

	#[tokio::test]
	async fn modify_response_return_is_ignored() {
		let dir = tempfile::tempdir().unwrap();
		let log = test_log(&dir);
		let payload = b"original payload";
		let packed = codec::compress(payload, ContentEncoding::Gzip).await.unwrap();
		let mut response = gzip_response(&packed.data);

		let plugin = DebugInterceptor {
			modify_response: Some(Box::new(|_| Bytes::from_static(b"replaced"))),
		};
		plugin.process_response(&mut response, &log).await;

		let unpacked = codec::decompress(&response.body, ContentEncoding::Gzip)
			.await
			.unwrap();
		assert_eq!(&unpacked.data[..], payload, "hook return must not leak");
	}

	#[tokio::test]
	async fn deflate_warning_reaches_the_log() {
		let dir = tempfile::tempdir().unwrap();
		let log = test_log(&dir);
		let packed = codec::compress(b"body", ContentEncoding::Deflate).await.unwrap();
		let mut with_garbage = packed.data.to_vec();
		with_garbage.push(0xff);
		let mut response = Response {
			version: "HTTP/1.1".to_string(),
			status: 200,
			reason: "OK".to_string(),
			headers: Headers::from_iter([
				("Content-Encoding", "deflate".to_string()),
				("Content-Length", with_garbage.len().to_string()),
			]),
			body: Bytes::from(with_garbage),
		};

		let plugin = DebugInterceptor::new();
		plugin.process_response(&mut response, &log).await;
		log.flush();

		let logged = std::fs::read_to_string(log.path()).unwrap();
		assert!(logged.contains(codec::DEFLATE_TRAILING_WARNING));
		assert_eq!(
			response.headers.content_length(),
			Some(response.body.len())
		);
	}
}
