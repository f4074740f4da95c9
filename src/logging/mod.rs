//! Logging statistics from training updates
mod chunk;
mod chunk_by_time;
mod display;

pub use chunk::{ChunkLogger, ChunkSummary, Chunker, SummaryWriter};
pub use chunk_by_time::ByTime;
pub use display::{DisplayBackend, DisplayLogger};

use smallvec::SmallVec;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Log statistics.
///
/// Values are logged in groups. A group is a set of values that are logged together,
/// chunkers only decide whether to flush at group boundaries.
pub trait StatsLogger: Send {
    /// Start a new group of logs.
    fn group_start(&mut self);

    /// Log a value within the current group.
    ///
    /// # Returns
    /// An error if the value is structurally incompatible with previous values logged under the
    /// same identifier.
    fn group_log(&mut self, id: Id, value: LogValue) -> Result<(), LogError>;

    /// End the current group of logs.
    fn group_end(&mut self);

    /// Write out any pending summaries.
    fn flush(&mut self);

    /// Log a single value as its own group.
    fn log(&mut self, id: Id, value: LogValue) -> Result<(), LogError> {
        self.group_start();
        let result = self.group_log(id, value);
        self.group_end();
        result
    }

    /// Log a scalar value.
    fn log_scalar(&mut self, name: &'static str, value: f64) -> Result<(), LogError> {
        self.log(name.into(), LogValue::Scalar(value))
    }

    /// Log a time duration.
    fn log_duration(&mut self, name: &'static str, duration: Duration) -> Result<(), LogError> {
        self.log(name.into(), LogValue::Duration(duration))
    }

    /// Increment a counter.
    fn log_counter_increment(
        &mut self,
        name: &'static str,
        increment: u64,
    ) -> Result<(), LogError> {
        self.log(name.into(), LogValue::Counter(increment))
    }
}

/// Logger that does nothing
impl StatsLogger for () {
    #[inline]
    fn group_start(&mut self) {}
    #[inline]
    fn group_log(&mut self, _: Id, _: LogValue) -> Result<(), LogError> {
        Ok(())
    }
    #[inline]
    fn group_end(&mut self) {}
    #[inline]
    fn flush(&mut self) {}
}

impl<T: StatsLogger + ?Sized> StatsLogger for &'_ mut T {
    #[inline]
    fn group_start(&mut self) {
        T::group_start(self)
    }
    #[inline]
    fn group_log(&mut self, id: Id, value: LogValue) -> Result<(), LogError> {
        T::group_log(self, id, value)
    }
    #[inline]
    fn group_end(&mut self) {
        T::group_end(self)
    }
    #[inline]
    fn flush(&mut self) {
        T::flush(self)
    }
}

/// Logger that prefixes all identifiers with a namespace scope.
pub struct ScopedLogger<'a> {
    logger: &'a mut dyn StatsLogger,
    scope: &'static str,
}

impl<'a> ScopedLogger<'a> {
    pub fn new(logger: &'a mut dyn StatsLogger, scope: &'static str) -> Self {
        Self { logger, scope }
    }
}

impl fmt::Debug for ScopedLogger<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScopedLogger")
            .field("scope", &self.scope)
            .finish()
    }
}

impl StatsLogger for ScopedLogger<'_> {
    fn group_start(&mut self) {
        self.logger.group_start()
    }
    fn group_log(&mut self, mut id: Id, value: LogValue) -> Result<(), LogError> {
        id.namespace.insert(0, self.scope);
        self.logger.group_log(id, value)
    }
    fn group_end(&mut self) {
        self.logger.group_end()
    }
    fn flush(&mut self) {
        self.logger.flush()
    }
}

/// Identifier of a logged value: a name within a namespace path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id {
    namespace: SmallVec<[&'static str; 4]>,
    name: Cow<'static, str>,
}

impl Id {
    pub fn new<T: Into<Cow<'static, str>>>(name: T) -> Self {
        Self {
            namespace: SmallVec::new(),
            name: name.into(),
        }
    }

    /// Add a scope to the front of the namespace.
    #[must_use]
    pub fn with_prefix(mut self, scope: &'static str) -> Self {
        self.namespace.insert(0, scope);
        self
    }
}

impl From<&'static str> for Id {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Id {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for scope in &self.namespace {
            write!(f, "{}/", scope)?;
        }
        write!(f, "{}", self.name)
    }
}

/// A value that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    /// Nothing. No data to log.
    Nothing,
    /// Increment a counter.
    Counter(u64),
    /// A time duration. Aggregated by taking means.
    Duration(Duration),
    /// A scalar value. Aggregated by taking means.
    Scalar(f64),
    /// A sample from a distribution over `0 .. (size - 1)`.
    Index { value: usize, size: usize },
}

impl LogValue {
    /// Name of the variant
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Nothing => "Nothing",
            Self::Counter(_) => "Counter",
            Self::Duration(_) => "Duration",
            Self::Scalar(_) => "Scalar",
            Self::Index { .. } => "Index",
        }
    }
}

impl From<f64> for LogValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<f32> for LogValue {
    fn from(value: f32) -> Self {
        Self::Scalar(value.into())
    }
}

impl From<Duration> for LogValue {
    fn from(duration: Duration) -> Self {
        Self::Duration(duration)
    }
}

/// Error logging a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("incompatible value type; previously {prev} now {now}")]
    IncompatibleValue {
        prev: &'static str,
        now: &'static str,
    },
    #[error("incompatible index size; previously {prev} now {now}")]
    IncompatibleIndexSize { prev: usize, now: usize },
    #[error("index {value} is out of range for size {size}")]
    IndexOutOfRange { value: usize, size: usize },
}
