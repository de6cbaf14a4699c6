pub mod bus;
pub mod events;
pub mod gateway;
pub mod refresh;
pub mod watcher;
