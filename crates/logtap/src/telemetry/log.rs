use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use uuid::Uuid;

/// Per-request log sink.
///
/// Every accepted connection owns exactly one `RequestLog`, bound to its
/// request id and backed by `<dir>/<request_id>.log`. No sharing across
/// connections, so concurrent exchanges never race on a file.
#[derive(Debug)]
pub struct RequestLog {
	id: Uuid,
	path: PathBuf,
	level: Level,
	writer: Mutex<BufWriter<File>>,
}

impl RequestLog {
	pub fn create(dir: &Path, id: Uuid, level: Level) -> std::io::Result<Self> {
		std::fs::create_dir_all(dir)?;
		let path = dir.join(format!("{id}.log"));
		let file = File::create(&path)?;
		Ok(Self {
			id,
			path,
			level,
			writer: Mutex::new(BufWriter::new(file)),
		})
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn debug(&self, msg: impl AsRef<str>) {
		self.write(Level::DEBUG, msg.as_ref());
	}

	pub fn info(&self, msg: impl AsRef<str>) {
		self.write(Level::INFO, msg.as_ref());
	}

	pub fn warn(&self, msg: impl AsRef<str>) {
		self.write(Level::WARN, msg.as_ref());
	}

	pub fn error(&self, msg: impl AsRef<str>) {
		self.write(Level::ERROR, msg.as_ref());
	}

	fn write(&self, level: Level, msg: &str) {
		// Level::ERROR < Level::WARN < ... < Level::TRACE
		if level > self.level {
			return;
		}
		let mut writer = self.writer.lock().expect("request log writer poisoned");
		// A full disk is not worth killing the exchange over.
		let _ = writeln!(writer, "{msg}");
	}

	pub fn flush(&self) {
		if let Ok(mut writer) = self.writer.lock() {
			let _ = writer.flush();
		}
	}
}

impl Drop for RequestLog {
	fn drop(&mut self) {
		self.flush();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_are_level_gated() {
		let dir = tempfile::tempdir().unwrap();
		let id = Uuid::new_v4();
		let log = RequestLog::create(dir.path(), id, Level::INFO).unwrap();
		log.info("kept");
		log.debug("dropped");
		log.flush();

		let content = std::fs::read_to_string(log.path()).unwrap();
		assert!(content.contains("kept"));
		assert!(!content.contains("dropped"));
	}

	#[test]
	fn one_file_per_request_id() {
		let dir = tempfile::tempdir().unwrap();
		let a = RequestLog::create(dir.path(), Uuid::new_v4(), Level::DEBUG).unwrap();
		let b = RequestLog::create(dir.path(), Uuid::new_v4(), Level::DEBUG).unwrap();
		a.info("from a");
		b.info("from b");
		drop(a);
		drop(b);

		let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
		assert_eq!(files.len(), 2);
	}
}
