//! Internal logging shim.
//!
//! Mirrors the pattern the underlying `rustls` dependency itself uses:
//! call sites write plain `trace!`/`debug!`/`warn!` and pay nothing when
//! the `logging` feature is off, instead of sprinkling `#[cfg(feature =
//! "logging")]` through every module.

#[cfg(feature = "logging")]
pub(crate) use log::{debug, error, info, trace, warn};

#[cfg(not(feature = "logging"))]
macro_rules! trace    ( ($($tt:tt)*) => {{}} );
#[cfg(not(feature = "logging"))]
macro_rules! debug    ( ($($tt:tt)*) => {{}} );
#[cfg(not(feature = "logging"))]
macro_rules! info     ( ($($tt:tt)*) => {{}} );
#[cfg(not(feature = "logging"))]
macro_rules! warn     ( ($($tt:tt)*) => {{}} );
#[cfg(not(feature = "logging"))]
macro_rules! error    ( ($($tt:tt)*) => {{}} );

#[cfg(not(feature = "logging"))]
pub(crate) use {debug, error, info, trace, warn};
