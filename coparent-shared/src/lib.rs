#![cfg_attr(not(test), forbid(unsafe_code))]

//! Shared models and configuration for the co-parenting realtime hub.

pub mod config;
pub mod models;
