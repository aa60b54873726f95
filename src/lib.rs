//! Elevation angle logging with a lock-guarded append-only log.
//!
//! Three kinds of process share one log directory:
//!
//! - the **logger** samples an angle sensor and appends records under the
//!   writer lock ([`logger`]),
//! - the **server** tails the log and answers "latest angle" queries from
//!   memory ([`server`]),
//! - **clients** ask the server once and exit ([`client`]).
//!
//! ```no_run
//! use ellog::core::{AngleRecord, LogStore};
//!
//! let store = LogStore::open("./el_log")?;
//! store.append(&AngleRecord::new(1, 10.0, false))?;
//! for record in store.read_all()? {
//!     println!("{record}");
//! }
//! # Ok::<(), ellog::core::Error>(())
//! ```

pub mod client;
pub mod core;
pub mod logger;
pub mod protocol;
pub mod server;
pub mod shutdown;

pub use crate::core::{AngleRecord, Error, LogStore, Result};
pub use client::{Client, ClientConfig};
pub use logger::{Logger, LoggerConfig};
pub use server::{Server, ServerConfig};
pub use shutdown::Shutdown;
