//! Instrument control and recording engine for Q-Series serial sensors
//! (firmware line "2150 REV 4.003"). See spec.md / SPEC_FULL.md.
//!
//! Five components, leaves first: the pure wire [`codec`], the
//! [`transport`] trait and its serial/simulator implementations, the
//! [`ring_buffer`], the [`controller`] state machine that drives them, and
//! the [`recorder`] background task that drains the ring buffer to disk.

pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod reading;
pub mod recorder;
pub mod ring_buffer;
pub mod transport;

pub use config::Config;
pub use controller::InstrumentController;
pub use error::{CodecError, ControllerError, RecorderError, TransportError};
pub use reading::{ControllerState, Mode, Reading, SensorConfig};
pub use recorder::{ChunkRecord, ChunkedRecorder, RecorderOptions, RecorderStatus, SessionDescriptor};
pub use ring_buffer::RingBuffer;
