//! Pipeline stages for field extraction.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and a backend can be swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ recognize ──▶ extract
//! (bytes)   (pdfium)   (base64)   (VLM call)    (JSON → fields)
//! ```
//!
//! 1. [`input`]: load a local file or raw bytes and detect PDF vs. image
//! 2. [`render`]: rasterise one page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`encode`]: PNG/JPEG base64 encoding and the inverse blob decoder
//! 4. [`recognize`]: the only stage with network I/O
//! 5. [`extract`]: prompt assembly and lenient reply parsing

pub mod encode;
pub mod extract;
pub mod input;
pub mod recognize;
pub mod render;
