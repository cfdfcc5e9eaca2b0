//! HTTP/1.x wire codec for the relay path.
//!
//! The proxy forwards headers byte-for-byte in their original order and
//! casing, which `http::HeaderMap` cannot express; headers live in an
//! ordered multimap with case-insensitive lookup instead. Bodies are always
//! fully materialised before plugins run.

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Upper bound on a request or response head. Heads beyond this are
/// malformed or hostile.
const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Http1Error {
	#[error("i/o: {0}")]
	Io(#[from] std::io::Error),
	#[error("malformed request: {0}")]
	BadRequest(String),
	#[error("malformed response: {0}")]
	BadResponse(String),
	#[error("{0} head exceeds {MAX_HEAD_BYTES} bytes")]
	HeadTooLarge(&'static str),
}

/// Ordered header multimap. Insertion order and name casing are preserved
/// for serialization; lookups are case-insensitive and return the first
/// occurrence, as the original wire order intended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
	entries: Vec<(String, String)>,
}

impl Headers {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.entries.push((name.into(), value.into()));
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.entries
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	/// Replace the first occurrence in place (keeping its casing), or append.
	pub fn set(&mut self, name: &str, value: impl Into<String>) {
		match self.entries.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
			Some((_, v)) => *v = value.into(),
			None => self.entries.push((name.to_string(), value.into())),
		}
	}

	/// Remove every occurrence of `name`.
	pub fn remove(&mut self, name: &str) {
		self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn content_length(&self) -> Option<usize> {
		self.get("Content-Length").and_then(|v| v.trim().parse().ok())
	}

	fn is_chunked(&self) -> bool {
		self
			.get("Transfer-Encoding")
			.is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
	}

	fn write_to(&self, out: &mut Vec<u8>) {
		for (name, value) in &self.entries {
			out.extend_from_slice(name.as_bytes());
			out.extend_from_slice(b": ");
			out.extend_from_slice(value.as_bytes());
			out.extend_from_slice(b"\r\n");
		}
		out.extend_from_slice(b"\r\n");
	}
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
	fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
		Self {
			entries: iter
				.into_iter()
				.map(|(n, v)| (n.into(), v.into()))
				.collect(),
		}
	}
}

/// One fully materialised client request.
#[derive(Debug, Clone)]
pub struct Request {
	pub method: String,
	pub path: String,
	pub version: String,
	pub headers: Headers,
	pub body: Bytes,
}

impl Request {
	pub fn title(&self) -> String {
		format!("{} {} {}", self.method, self.path, self.version)
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(256 + self.body.len());
		out.extend_from_slice(self.title().as_bytes());
		out.extend_from_slice(b"\r\n");
		self.headers.write_to(&mut out);
		out.extend_from_slice(&self.body);
		out
	}
}

/// One fully materialised upstream response.
#[derive(Debug, Clone)]
pub struct Response {
	pub version: String,
	pub status: u16,
	pub reason: String,
	pub headers: Headers,
	pub body: Bytes,
}

impl Response {
	pub fn title(&self) -> String {
		format!("{} {} {}", self.version, self.status, self.reason)
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(256 + self.body.len());
		out.extend_from_slice(self.title().as_bytes());
		out.extend_from_slice(b"\r\n");
		self.headers.write_to(&mut out);
		out.extend_from_slice(&self.body);
		out
	}
}

/// Read one request head plus its body. Returns `None` on clean EOF before
/// the first byte. Request bodies are framed by `Content-Length` only;
/// chunked client bodies are not supported.
pub async fn read_request<R: AsyncBufRead + Unpin>(
	reader: &mut R,
) -> Result<Option<Request>, Http1Error> {
	let Some(head) = read_head(reader, "request").await? else {
		return Ok(None);
	};

	let mut header_storage = [httparse::EMPTY_HEADER; 64];
	let mut parsed = httparse::Request::new(&mut header_storage);
	match parsed.parse(&head) {
		Ok(httparse::Status::Complete(_)) => {},
		Ok(httparse::Status::Partial) => {
			return Err(Http1Error::BadRequest("truncated head".to_string()));
		},
		Err(e) => return Err(Http1Error::BadRequest(e.to_string())),
	}

	let method = parsed
		.method
		.ok_or_else(|| Http1Error::BadRequest("missing method".to_string()))?
		.to_string();
	let path = parsed
		.path
		.ok_or_else(|| Http1Error::BadRequest("missing path".to_string()))?
		.to_string();
	let version = format!(
		"HTTP/1.{}",
		parsed
			.version
			.ok_or_else(|| Http1Error::BadRequest("missing version".to_string()))?
	);
	let headers = copy_headers(parsed.headers, Http1Error::BadRequest)?;

	let body = match headers.content_length() {
		Some(len) => {
			let mut body = vec![0u8; len];
			reader.read_exact(&mut body).await?;
			Bytes::from(body)
		},
		None => Bytes::new(),
	};

	Ok(Some(Request {
		method,
		path,
		version,
		headers,
		body,
	}))
}

/// Read one response head plus its fully materialised body. The returned
/// bool is false when the upstream closed mid-body; callers relay whatever
/// arrived and log the truncation.
pub async fn read_response<R: AsyncBufRead + Unpin>(
	reader: &mut R,
) -> Result<(Response, bool), Http1Error> {
	let head = read_head(reader, "response")
		.await?
		.ok_or_else(|| Http1Error::BadResponse("connection closed before status line".to_string()))?;

	let mut header_storage = [httparse::EMPTY_HEADER; 64];
	let mut parsed = httparse::Response::new(&mut header_storage);
	match parsed.parse(&head) {
		Ok(httparse::Status::Complete(_)) => {},
		Ok(httparse::Status::Partial) => {
			return Err(Http1Error::BadResponse("truncated head".to_string()));
		},
		Err(e) => return Err(Http1Error::BadResponse(e.to_string())),
	}

	let version = format!(
		"HTTP/1.{}",
		parsed
			.version
			.ok_or_else(|| Http1Error::BadResponse("missing version".to_string()))?
	);
	let status = parsed
		.code
		.ok_or_else(|| Http1Error::BadResponse("missing status".to_string()))?;
	let reason = parsed.reason.unwrap_or("").to_string();
	let headers = copy_headers(parsed.headers, Http1Error::BadResponse)?;

	let (body, complete) = if headers.is_chunked() {
		read_chunked_body(reader).await?
	} else if let Some(len) = headers.content_length() {
		let body = read_up_to(reader, len).await?;
		let complete = body.len() == len;
		(body, complete)
	} else {
		// Unknown length: the body runs until the upstream closes.
		let mut body = Vec::new();
		reader.read_to_end(&mut body).await?;
		(body, true)
	};

	Ok((
		Response {
			version,
			status,
			reason,
			headers,
			body: Bytes::from(body),
		},
		complete,
	))
}

/// Accumulate head lines up to and including the blank line. `None` means
/// EOF before any byte arrived. The cap bounds the whole head, including a
/// single line that never terminates.
async fn read_head<R: AsyncBufRead + Unpin>(
	reader: &mut R,
	kind: &'static str,
) -> Result<Option<Vec<u8>>, Http1Error> {
	let mut head = Vec::new();
	let mut limited = (&mut *reader).take((MAX_HEAD_BYTES + 1) as u64);
	loop {
		let start = head.len();
		let n = limited.read_until(b'\n', &mut head).await?;
		if head.len() > MAX_HEAD_BYTES {
			return Err(Http1Error::HeadTooLarge(kind));
		}
		if n == 0 {
			if head.is_empty() {
				return Ok(None);
			}
			return Err(Http1Error::Io(std::io::Error::new(
				std::io::ErrorKind::UnexpectedEof,
				format!("connection closed inside {kind} head"),
			)));
		}
		let line = &head[start..];
		if line == b"\r\n" || line == b"\n" {
			return Ok(Some(head));
		}
	}
}

fn copy_headers(
	parsed: &[httparse::Header<'_>],
	malformed: fn(String) -> Http1Error,
) -> Result<Headers, Http1Error> {
	let mut headers = Headers::new();
	for h in parsed {
		let value = std::str::from_utf8(h.value)
			.map_err(|_| malformed(format!("non-utf8 value for header {}", h.name)))?;
		headers.push(h.name, value);
	}
	Ok(headers)
}

/// Read up to `len` bytes, stopping early at EOF.
async fn read_up_to<R: AsyncRead + Unpin>(
	reader: &mut R,
	len: usize,
) -> Result<Vec<u8>, Http1Error> {
	let mut body = Vec::with_capacity(len.min(1 << 20));
	let mut chunk = [0u8; 8192];
	while body.len() < len {
		let want = (len - body.len()).min(chunk.len());
		let n = reader.read(&mut chunk[..want]).await?;
		if n == 0 {
			break;
		}
		body.extend_from_slice(&chunk[..n]);
	}
	Ok(body)
}

/// Decode a chunked body into contiguous bytes, consuming any trailers.
/// EOF mid-stream yields the bytes received so far with `complete = false`.
async fn read_chunked_body<R: AsyncBufRead + Unpin>(
	reader: &mut R,
) -> Result<(Vec<u8>, bool), Http1Error> {
	let mut body = Vec::new();
	loop {
		let mut size_line = Vec::new();
		if reader.read_until(b'\n', &mut size_line).await? == 0 {
			return Ok((body, false));
		}
		let size_str = std::str::from_utf8(&size_line)
			.map_err(|_| Http1Error::BadResponse("non-utf8 chunk size".to_string()))?
			.trim();
		// Chunk extensions after ';' are ignored.
		let size_str = size_str.split(';').next().unwrap_or("");
		let size = usize::from_str_radix(size_str, 16)
			.map_err(|_| Http1Error::BadResponse(format!("bad chunk size {size_str:?}")))?;

		if size == 0 {
			// Trailer section: lines until the terminating blank line.
			loop {
				let mut trailer = Vec::new();
				if reader.read_until(b'\n', &mut trailer).await? == 0 {
					return Ok((body, false));
				}
				if trailer == b"\r\n" || trailer == b"\n" {
					return Ok((body, true));
				}
			}
		}

		let chunk = read_up_to(reader, size).await?;
		let got = chunk.len();
		body.extend_from_slice(&chunk);
		if got < size {
			return Ok((body, false));
		}
		// Trailing CRLF after the chunk data.
		let mut crlf = Vec::new();
		if reader.read_until(b'\n', &mut crlf).await? == 0 {
			return Ok((body, false));
		}
	}
}
