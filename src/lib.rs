//! nsq-broker - NSQ broker controller
//!
//! Exposes NSQ through a small broker interface: publish, subscribe, topic
//! discovery and shutdown. Subscriptions are addressed as `topic#channel`
//! and delivered through bounded, cancellable channels.

pub mod broker;
pub mod config;
pub mod nsq;
pub mod utils;
