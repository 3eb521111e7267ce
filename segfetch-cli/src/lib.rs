//! Library target for the `segfetch` package.
//!
//! The primary deliverable of this package is the `segfetch` CLI binary
//! (`src/main.rs`). This library exists so CI can run `cargo test -p segfetch --doc`.

#[doc(hidden)]
pub use segfetch_engine;
