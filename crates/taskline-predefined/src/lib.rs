//! Bundled wrappers around third-party tools, built on top of
//! `taskline_core`'s public builder API.
//!
//! Each predefined step is a thin descriptor: a defaults layer plus a
//! callable that shells out to the wrapped tool inside the step's curated
//! environment. Grounded on `original_source/src/wast/predefined`'s
//! `_isort.py`/`_twine.py` pattern (`@set_defaults` + a free-function
//! constructor), adapted here to a function that registers directly onto a
//! [`taskline_core::Pipeline`] since there is no decorator equivalent in
//! Rust.

mod pytest;

pub use pytest::{pytest, PytestOptions};
