pub mod analysis;
pub mod db;
pub mod ipc;
pub mod notify;
pub mod suggest;
