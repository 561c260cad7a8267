//! Geofetch - pooled HTTP request layer for map service clients
//!
//! Every outbound call (geocoding, routing, place lookups) goes through one
//! [`Dispatcher`]: per-host persistent connections, a fixed set of workers that
//! bound in-flight requests, retry on broken connections, and a one-way
//! termination that never waits for stuck requests.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod network;
pub mod task;
pub mod worker;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{FailureKind, GeofetchError, Result, TransientKind};
pub use task::{Encoding, Payload, RequestOptions};
