//! Error plumbing shared across the workspace.
//!
//! - [`Location`] is captured implicitly by `snafu` context selectors and
//!   records where an error was raised.
//! - [`ErrorLocation`] exposes that location from an error value.
//! - [`GenericError`] is a `whatever`-style error for binaries.
//! - [`Report`] renders an error together with its chain of causes, asking a
//!   [`Locator`] where each cause was raised.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::{boxed::Box, string::String};
use core::{error::Error, fmt};

use snafu::{GenerateImplicitData, Snafu};

/// Source location captured when an error is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl Location {
    /// Returns the source file the error was raised in.
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    /// Returns the line the error was raised on.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An error that knows where it was raised.
pub trait ErrorLocation {
    /// Returns the location captured when the error was constructed.
    fn location(&self) -> Option<Location>;
}

/// A catch-all error carrying a message and an optional boxed cause.
#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn core::error::Error>, Some)))]
    source: Option<Box<dyn core::error::Error>>,
}

impl ErrorLocation for GenericError {
    fn location(&self) -> Option<Location> {
        Some(self.location)
    }
}

/// Finds the location of a cause in an error chain.
///
/// Causes are only seen as `dyn Error`, so a locator downcasts them to the
/// concrete types it knows about.
pub type Locator = fn(&(dyn Error + 'static)) -> Option<Location>;

/// Locates causes that are [`GenericError`]s.
#[must_use]
pub fn locate_generic(error: &(dyn Error + 'static)) -> Option<Location> {
    error
        .downcast_ref::<GenericError>()
        .and_then(ErrorLocation::location)
}

/// Multi-line rendering of an error and its causes.
///
/// ```text
/// error: failed to resize block 0 to 9000 bytes
///   at crates/chunk-dump/src/main.rs:67:14
///
/// caused by:
///    0: failed to allocate the resized block
///       at crates/chunk-alloc/src/allocator.rs:214:35
///    1: failed to map 3 pages
///       at crates/chunk-alloc/src/allocator.rs:258:14
///    2: out of memory
/// ```
pub struct Report<E> {
    error: E,
    locator: Locator,
}

impl<E> Report<E> {
    /// Creates a report that locates [`GenericError`] causes.
    pub fn new(error: E) -> Self {
        Self::with_locator(error, locate_generic)
    }

    /// Creates a report that locates causes with `locator`.
    pub fn with_locator(error: E, locator: Locator) -> Self {
        Self { error, locator }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + ErrorLocation,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + ErrorLocation,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.error)?;
        if let Some(loc) = self.error.location() {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            if let Some(loc) = (self.locator)(s) {
                writeln!(f, "      at {loc}")?;
            }
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}
