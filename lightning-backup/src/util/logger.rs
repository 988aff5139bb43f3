// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Log traits live here, which are called throughout the crate to report what the backup
//! machinery is doing.
//!
//! Log messages should be filtered client-side by implementing check against a given [`Record`]'s
//! [`Level`] field. Each component may have its own Logger or share one.

use bitcoin::secp256k1::PublicKey;

use core::cmp;
use core::fmt;
use core::fmt::Display;
use core::fmt::Write;
use core::ops::Deref;

static LOG_LEVEL_NAMES: [&'static str; 6] = ["GOSSIP", "TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// An enum representing the available verbosity levels of the logger.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Level {
	/// Designates extremely verbose information
	Gossip,
	/// Designates very low priority, often extremely verbose, information
	Trace,
	/// Designates lower priority information
	Debug,
	/// Designates useful information
	Info,
	/// Designates hazardous situations
	Warn,
	/// Designates very serious errors
	Error,
}

impl PartialOrd for Level {
	#[inline]
	fn partial_cmp(&self, other: &Level) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Level {
	#[inline]
	fn cmp(&self, other: &Level) -> cmp::Ordering {
		(*self as usize).cmp(&(*other as usize))
	}
}

impl fmt::Display for Level {
	fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
		fmt.pad(LOG_LEVEL_NAMES[*self as usize])
	}
}

impl Level {
	/// Returns the most verbose logging level.
	#[inline]
	pub fn max() -> Level {
		Level::Gossip
	}
}

/// A Record, unit of logging output with Metadata to enable filtering
/// Module_path, file, line to inform on log's source
#[derive(Clone, Debug)]
pub struct Record<'a> {
	/// The verbosity level of the message.
	pub level: Level,
	/// The node id of the peer pertaining to the logged record. Since peer_id is not repeated in
	/// the message body, include it in the log output so entries remain clear.
	pub peer_id: Option<PublicKey>,
	/// The message body.
	pub args: fmt::Arguments<'a>,
	/// The module path of the message.
	pub module_path: &'static str,
	/// The source file containing the message.
	pub file: &'static str,
	/// The line containing the message.
	pub line: u32,
}

impl<'a> Record<'a> {
	/// Returns a new Record.
	#[inline]
	pub fn new(
		level: Level, peer_id: Option<PublicKey>, args: fmt::Arguments<'a>,
		module_path: &'static str, file: &'static str, line: u32,
	) -> Record<'a> {
		Record { level, peer_id, args, module_path, file, line }
	}
}

impl<'a> Display for Record<'a> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut context_formatter = SubstringFormatter::new(48, f);
		write!(&mut context_formatter, "{:<5} [{}:{}]", self.level, self.module_path, self.line)?;
		context_formatter.pad_remaining()?;

		write!(f, " {}", self.args)?;
		if let Some(peer_id) = self.peer_id {
			write!(f, " [")?;
			let mut peer_formatter = SubstringFormatter::new(8, f);
			write!(peer_formatter, "p:{}", peer_id)?;
			write!(f, "]")?;
		}
		Ok(())
	}
}

// Writes only up to a certain number of unicode characters to the underlying formatter.
struct SubstringFormatter<'fmt: 'r, 'r> {
	remaining_chars: usize,
	fmt: &'r mut fmt::Formatter<'fmt>,
}

impl<'fmt: 'r, 'r> SubstringFormatter<'fmt, 'r> {
	fn new(length: usize, formatter: &'r mut fmt::Formatter<'fmt>) -> Self {
		debug_assert!(length <= 100);
		SubstringFormatter { remaining_chars: length, fmt: formatter }
	}

	fn pad_remaining(&mut self) -> fmt::Result {
		const PAD100: &str = "                                                                                                    "; // 100 spaces

		self.fmt.write_str(&PAD100[..self.remaining_chars])?;
		self.remaining_chars = 0;

		Ok(())
	}
}

impl<'fmt: 'r, 'r> Write for SubstringFormatter<'fmt, 'r> {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		let mut char_count = 0;
		let mut next_char_byte_pos = 0;

		// Take one more than the number of remaining characters so we can find the byte boundary
		// where we should stop writing.
		for (pos, _) in s.char_indices().take(self.remaining_chars + 1) {
			char_count += 1;
			next_char_byte_pos = pos;
		}

		let split_pos = if char_count == self.remaining_chars + 1 {
			self.remaining_chars = 0;
			next_char_byte_pos
		} else {
			self.remaining_chars -= char_count;
			s.len()
		};

		self.fmt.write_str(&s[..split_pos])
	}
}

/// A trait encapsulating the operations required of a logger.
pub trait Logger {
	/// Logs the [`Record`]. Since [`Record::peer_id`] is not embedded in the message body, log
	/// implementations should print it alongside the message to keep entries clear.
	fn log(&self, record: Record);
}

/// Adds the peer's node id to a [`Record`] before passing it to the wrapped [`Logger`].
pub struct WithContext<'a, L: Deref>
where
	L::Target: Logger,
{
	logger: &'a L,
	peer_id: Option<PublicKey>,
}

impl<'a, L: Deref> Logger for WithContext<'a, L>
where
	L::Target: Logger,
{
	fn log(&self, mut record: Record) {
		if self.peer_id.is_some() {
			record.peer_id = self.peer_id
		};
		self.logger.log(record)
	}
}

impl<'a, L: Deref> WithContext<'a, L>
where
	L::Target: Logger,
{
	/// Wraps the given logger, providing additional context to any logged records.
	pub fn from(logger: &'a L, peer_id: Option<PublicKey>) -> Self {
		WithContext { logger, peer_id }
	}
}

#[cfg(test)]
mod tests {
	use crate::util::logger::{Level, Logger, WithContext};
	use crate::util::test_utils::{self, TestLogger};
	use std::sync::Arc;

	#[test]
	fn test_level_show() {
		assert_eq!("INFO", Level::Info.to_string());
		assert_eq!("ERROR", Level::Error.to_string());
		assert_ne!("WARN", Level::Error.to_string());
	}

	#[test]
	fn test_level_ordering() {
		assert!(Level::Gossip < Level::Trace);
		assert!(Level::Warn < Level::Error);
		assert_eq!(Level::max(), Level::Gossip);
	}

	struct WrapperLog {
		logger: Arc<dyn Logger>,
	}

	impl WrapperLog {
		fn new(logger: Arc<dyn Logger>) -> WrapperLog {
			WrapperLog { logger }
		}

		fn call_macros(&self) {
			log_error!(self.logger, "This is an error");
			log_warn!(self.logger, "This is a warning");
			log_info!(self.logger, "This is an info");
			log_debug!(self.logger, "This is a debug");
			log_trace!(self.logger, "This is a trace");
			log_gossip!(self.logger, "This is a gossip");
		}
	}

	#[test]
	fn test_logging_macros() {
		let logger = Arc::new(TestLogger::new());
		let wrapper = WrapperLog::new(Arc::clone(&logger) as Arc<dyn Logger>);
		wrapper.call_macros();
		logger.assert_log_contains("lightning_backup::util::logger::tests", "This is an error", 1);
		logger.assert_log_contains("lightning_backup::util::logger::tests", "This is a gossip", 1);
	}

	#[test]
	fn test_logging_with_context() {
		let logger = &TestLogger::new();
		let peer = test_utils::pubkey(42);
		let context_logger = WithContext::from(&logger, Some(peer));
		log_info!(context_logger, "This is an info");
		assert_eq!(logger.count_with_peer(&peer), 1);
		log_info!(logger, "This has no peer");
		assert_eq!(logger.count_with_peer(&peer), 1);
	}
}
