pub mod app_state;
pub mod backend;
pub mod io_struct;
pub mod server;
pub mod session;
pub mod store;
