//! Types shared between the sync core and the terminal client.
//!
//! Everything here mirrors a row or payload of the remote store, so field
//! names follow the wire format.

mod changes;
mod models;
mod palette;

pub use changes::*;
pub use models::*;
pub use palette::*;
