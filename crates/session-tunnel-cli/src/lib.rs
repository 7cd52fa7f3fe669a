//! Command-line front end for session tunnels

pub mod config;
