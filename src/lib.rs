//! Devgate - A development proxy that supervises a frontend dev server
//!
//! This library provides a reverse proxy for local frontend development that:
//! - Launches the frontend dev server (Vite by default) as a child process
//! - Detects readiness from the dev server's log output or an HTTP probe
//! - Forwards non-backend requests to the dev server while it is running
//! - Answers live-reload WebSocket upgrades with a pointer to the dev server
//! - Tears the whole process tree down on shutdown
//! - Uses connection pooling for efficient dev server communication

pub mod config;
pub mod error;
pub mod mode;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod upgrade;
