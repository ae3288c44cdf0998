//! Wire protocol of the Realtime API: typed client and server events plus the
//! models they carry.

pub mod client_events;
pub mod models;
pub mod server_events;
