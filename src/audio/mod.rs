//! # Audio Module
//!
//! Everything between "bytes arrived on a client socket" and "chunk handed to the
//! upstream client".
//!
//! ## Key Components:
//! - **Buffer**: bounded ring buffer (streaming mode) and a chunk accumulator (synchronous mode)
//! - **Processor**: PCM validation, sample conversion and linear-interpolation resampling
//! - **Session**: per-connection state tying the processor to a remote client
//!
//! ## Audio Format:
//! - **Encoding**: signed 16-bit little-endian PCM ("LINEAR16")
//! - **Channels**: mono
//! - **Rates**: client rate in, upstream rate out (16kHz → 24kHz by default)

pub mod buffer;
pub mod processor;
pub mod session;
