//! # Code
//!
//! Machine code snippets written by patches and hooks

pub mod x64;
