// SPDX-License-Identifier: Apache-2.0

//! LDRadar Library
//!
//! This library provides a driver for the HiLink LD2410 presence sensor and
//! LD2450 multi-target tracking sensor, which speak a framed binary protocol
//! over a serial link.
//!
//! # Features
//!
//! - **Link Layer** - Command framing with the config-mode handshake
//! - **LD2410** - Presence readings with optional per-gate energies
//! - **LD2450** - Up to three tracked targets with planar coordinates
//! - **Polling** - Background task publishing the latest decoded reading
//! - **Serial** - Transport implementation backed by the serialport crate
//!
//! The protocol engine is written against the [`link::Transport`] trait so
//! it can be exercised without hardware; only the feature-gated `serial`
//! module touches a physical device.

#![warn(missing_docs)]

/// Link layer: transport seam, frame synchronization and module commands
pub mod link;

/// LD2410 presence sensor protocol
pub mod ld2410;

/// LD2450 coordinate tracking sensor protocol
pub mod ld2450;

/// Background polling loop and shared reading slot
pub mod poll;

/// Serial device transport
#[cfg(feature = "serial")]
pub mod serial;
