//! Integration test crate for the PlayGrid control plane.
//!
//! All test code lives under `tests/`; this library exists only to anchor
//! the package.
