//! Minion Common Library
//!
//! This crate provides shared constants, configuration loading and the
//! wire-level types used by every crate in the minion workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Size caps, segment naming and reserved state keys
//! - [`config`] - Configuration structs and the TOML loader
//! - [`status`] - The minion lifecycle status
//! - [`message`] - Channel packets and log records
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use minion_common::consts::state_store_name;
//! use minion_common::status::MinionStatus;
//!
//! assert_eq!(state_store_name("camera"), "camera_shared_dict");
//! assert_eq!(MinionStatus::from_code(-1), Some(MinionStatus::ShuttingDown));
//! ```

pub mod config;
pub mod consts;
pub mod message;
pub mod prelude;
pub mod status;
