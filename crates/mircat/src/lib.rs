// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mircat TCP toolkit
//!
//! Three independent engines for poking at TCP services by hand.
//!
//! # Features
//!
//! - **Outbound client**: numbered connections that redial forever at a fixed
//!   interval until explicitly closed
//! - **Inbound server**: multi-peer listener with point sends and broadcast
//! - **Relay**: pairs every inbound client with its own connection to a fixed
//!   destination; the destination leg reconnects, the client leg owns the pair
//!
//! Engines report everything they observe through a [`Notifier`]. The
//! [`ConnectionCoordinator`] drives all three from an [`AppConfig`] and turns
//! failures into notifications for callers that only speak base64.
//!
//! # Quick Start
//!
//! ```bash
//! # Write a default config.json
//! mircat gen-config
//!
//! # Accept peers on 0.0.0.0:8080
//! mircat server --bind 0.0.0.0:8080
//!
//! # Relay :9090 to a local service
//! mircat relay --bind 0.0.0.0:9090 --downstream 127.0.0.1:8080
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
mod link;
pub mod notify;
pub mod reconnect;
mod registry;
pub mod relay;
pub mod server;

pub use client::{ClientError, OutboundEngine};
pub use config::{AppConfig, ConfigError};
pub use coordinator::{BoundaryEvent, BoundaryIdentity, ConnectionCoordinator, CoordinatorError};
pub use notify::{ChannelNotifier, Event, Identity, Notification, Notifier, Scope, TracingNotifier};
pub use reconnect::ReconnectPolicy;
pub use relay::{RelayEngine, RelayError};
pub use server::{InboundEngine, ServerError};
