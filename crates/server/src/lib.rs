pub mod bridge;
pub mod config;
pub mod routes;
pub mod setup;

pub use config::Config;
pub use routes::App;
