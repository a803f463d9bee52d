pub mod callback;
pub mod client;
pub mod message;
pub mod signature;
