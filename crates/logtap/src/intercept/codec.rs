//! Content-encoding transcoding over fully materialised bodies.

use async_compression::tokio::bufread::{
	BrotliDecoder, BrotliEncoder, GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder,
};
use bytes::Bytes;
use tokio::io::AsyncReadExt;

/// Warning surfaced when a zlib stream carries bytes past its end marker.
pub const DEFLATE_TRAILING_WARNING: &str = "Some unused data was left over";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	#[error("{encoding} decompression failed: {source}")]
	Decompress {
		encoding: ContentEncoding,
		#[source]
		source: std::io::Error,
	},
	#[error("{encoding} compression failed: {source}")]
	Compress {
		encoding: ContentEncoding,
		#[source]
		source: std::io::Error,
	},
}

/// The body encodings the pipeline can transcode. `deflate` means
/// zlib-wrapped DEFLATE, not the raw stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
	Gzip,
	Deflate,
	Brotli,
}

impl ContentEncoding {
	/// Parse a `Content-Encoding` header value. Anything unrecognised is
	/// `None`: callers pass the body through untouched and log a warning.
	pub fn parse(value: &str) -> Option<Self> {
		match value.trim().to_ascii_lowercase().as_str() {
			"gzip" => Some(Self::Gzip),
			"deflate" => Some(Self::Deflate),
			"br" => Some(Self::Brotli),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Gzip => "gzip",
			Self::Deflate => "deflate",
			Self::Brotli => "br",
		}
	}
}

impl std::fmt::Display for ContentEncoding {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Output of one transcoding step. `warning` is set for recoverable oddities
/// (currently only trailing bytes after a zlib stream).
#[derive(Debug, Clone)]
pub struct Transcoded {
	pub data: Bytes,
	pub warning: Option<&'static str>,
}

pub async fn decompress(body: &[u8], encoding: ContentEncoding) -> Result<Transcoded, CodecError> {
	let map_err = |source| CodecError::Decompress { encoding, source };
	match encoding {
		ContentEncoding::Gzip => {
			let mut decoder = GzipDecoder::new(body);
			let mut out = Vec::new();
			decoder.read_to_end(&mut out).await.map_err(map_err)?;
			Ok(Transcoded {
				data: out.into(),
				warning: None,
			})
		},
		ContentEncoding::Deflate => {
			let mut decoder = ZlibDecoder::new(body);
			let mut out = Vec::new();
			decoder.read_to_end(&mut out).await.map_err(map_err)?;
			// The decoder stops consuming at the end of the zlib stream;
			// whatever is left in the slice never belonged to it.
			let leftover = !decoder.into_inner().is_empty();
			Ok(Transcoded {
				data: out.into(),
				warning: leftover.then_some(DEFLATE_TRAILING_WARNING),
			})
		},
		ContentEncoding::Brotli => {
			let mut decoder = BrotliDecoder::new(body);
			let mut out = Vec::new();
			decoder.read_to_end(&mut out).await.map_err(map_err)?;
			Ok(Transcoded {
				data: out.into(),
				warning: None,
			})
		},
	}
}

pub async fn compress(body: &[u8], encoding: ContentEncoding) -> Result<Transcoded, CodecError> {
	let map_err = |source| CodecError::Compress { encoding, source };
	let mut out = Vec::new();
	match encoding {
		ContentEncoding::Gzip => {
			let mut encoder = GzipEncoder::new(body);
			encoder.read_to_end(&mut out).await.map_err(map_err)?;
		},
		ContentEncoding::Deflate => {
			let mut encoder = ZlibEncoder::new(body);
			encoder.read_to_end(&mut out).await.map_err(map_err)?;
		},
		ContentEncoding::Brotli => {
			let mut encoder = BrotliEncoder::new(body);
			encoder.read_to_end(&mut out).await.map_err(map_err)?;
		},
	}
	Ok(Transcoded {
		data: out.into(),
		warning: None,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	const ENCODINGS: [ContentEncoding; 3] = [
		ContentEncoding::Gzip,
		ContentEncoding::Deflate,
		ContentEncoding::Brotli,
	];

	#[tokio::test]
	async fn round_trips_preserve_bytes() {
		let payload = b"{\"a\":1,\"blob\":\"ababababababababab\"}";
		for encoding in ENCODINGS {
			let packed = compress(payload, encoding).await.unwrap();
			assert!(packed.warning.is_none());
			let unpacked = decompress(&packed.data, encoding).await.unwrap();
			assert_eq!(&unpacked.data[..], payload, "{encoding} round trip");
			assert!(unpacked.warning.is_none());
		}
	}

	#[tokio::test]
	async fn empty_body_round_trips() {
		for encoding in ENCODINGS {
			let packed = compress(b"", encoding).await.unwrap();
			let unpacked = decompress(&packed.data, encoding).await.unwrap();
			assert!(unpacked.data.is_empty(), "{encoding}");
		}
	}

	#[tokio::test]
	async fn deflate_trailing_bytes_warn_but_succeed() {
		let packed = compress(b"payload", ContentEncoding::Deflate).await.unwrap();
		let mut with_garbage = packed.data.to_vec();
		with_garbage.push(0x42);

		let unpacked = decompress(&with_garbage, ContentEncoding::Deflate)
			.await
			.unwrap();
		assert_eq!(&unpacked.data[..], b"payload");
		assert_eq!(unpacked.warning, Some(DEFLATE_TRAILING_WARNING));
	}

	#[tokio::test]
	async fn corrupt_gzip_is_an_error() {
		let err = decompress(b"definitely not gzip", ContentEncoding::Gzip)
			.await
			.unwrap_err();
		assert!(matches!(err, CodecError::Decompress { .. }));
	}

	#[test]
	fn unknown_encodings_are_pass_through() {
		assert_eq!(ContentEncoding::parse("gzip"), Some(ContentEncoding::Gzip));
		assert_eq!(ContentEncoding::parse("BR"), Some(ContentEncoding::Brotli));
		assert_eq!(ContentEncoding::parse("zstd"), None);
		assert_eq!(ContentEncoding::parse(""), None);
	}
}
