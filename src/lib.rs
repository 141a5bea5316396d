#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! receptor-gateway library: the building blocks shared by the gateway and
//! its companion binaries.
//!
//! - `protocol`: receptor wire frames and message kinds
//! - `session`: per-connection transport pumps and the `Sessionlike` handle
//! - `reactor`, `handshake`, `handlers`: inbound message dispatch
//! - `registry`, `registrar`, `dns`: local and fleet-wide connection ownership
//! - `proxy`, `locator`: reaching connections owned by other replicas
//! - `queue`: response publication and consumption
//! - `routes`, `ws`, `auth`: HTTP and WebSocket surfaces

pub mod auth;
pub mod config;
pub mod dns;
pub mod handlers;
pub mod handshake;
pub mod locator;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod queue;
pub mod reactor;
pub mod registrar;
pub mod registry;
pub mod routes;
pub mod session;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use registry::Registrar;
pub use session::{Session, Sessionlike};
pub use state::AppState;
