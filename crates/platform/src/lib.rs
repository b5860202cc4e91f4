//! Shared foundations for the Tern SSH client.
//!
//! Two concerns live here so every protocol layer agrees on them: the
//! [`TernError`] taxonomy every fallible call returns, and the
//! [`RandomSource`] seam through which padding, cookies and key exchange
//! secrets are drawn.
//!
//! ```
//! use tern_platform::{RandomSource, SeededRandom, TernError};
//!
//! let (a, b) = (SeededRandom::new(42), SeededRandom::new(42));
//! let (mut x, mut y) = ([0u8; 8], [0u8; 8]);
//! a.fill(&mut x);
//! b.fill(&mut y);
//! assert_eq!(x, y);
//!
//! let err = TernError::Disconnect { code: 11, message: "bye".into() };
//! assert!(!err.is_timeout());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod random;

pub use error::{TernError, TernResult};
pub use random::{OsRandom, RandomSource, SeededRandom, SharedRandom};
