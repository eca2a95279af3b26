pub mod origin;
pub mod retry;
