//! # Collar Firmware Library
//!
//! Control core for a GNSS/IMU wildlife and livestock tracking collar with a
//! LoRaWAN or cellular uplink.
//!
//! This library samples the collar's sensors on a power-aware schedule,
//! buffers every sample in crash-consistent flash, and delivers batches over
//! the radio with acknowledgement, retry and backoff.

pub mod buffer;
pub mod config;
pub mod control;
pub mod error;
pub mod power;
pub mod radio;
pub mod sample;
pub mod scheduler;
pub mod sensors;
pub mod serial;
pub mod sim;
pub mod state;
pub mod storage;
pub mod telemetry;
