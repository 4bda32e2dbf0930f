pub mod api;
pub mod config;
pub mod error;
pub mod fc;
pub mod history;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod state;
pub mod stream;
pub mod transport;
pub mod wire;

mod util;
