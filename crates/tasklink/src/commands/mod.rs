//! Command implementations that do not need an [`App`](crate::app::App).

pub mod init;
