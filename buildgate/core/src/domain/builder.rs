// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ephemeral builder aggregate.
//!
//! A builder is one remote BuildKit daemon for one architecture, owned by a
//! single build. Its state only moves forward:
//!
//! ```text
//! Unacquired -> Booting -> Ready -> Released
//!                      \-> Error
//! ```

use crate::domain::platform::{worker_platforms, Architecture};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuilderId(pub String);

impl BuilderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuilderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderState {
    Unacquired,
    Booting,
    Ready,
    Error,
    Released,
}

impl BuilderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuilderState::Error | BuilderState::Released)
    }

    fn can_transition_to(&self, next: BuilderState) -> bool {
        matches!(
            (self, next),
            (BuilderState::Unacquired, BuilderState::Booting)
                | (BuilderState::Booting, BuilderState::Ready)
                | (BuilderState::Booting, BuilderState::Error)
                | (BuilderState::Ready, BuilderState::Released)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Builder {builder} cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub builder: String,
    pub from: BuilderState,
    pub to: BuilderState,
}

/// Where an acquired builder can be reached, as handed out by the bookkeeping service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderEndpoint {
    pub builder_id: BuilderId,
    /// gRPC address of the daemon (e.g. `https://builder-1.example.dev:443`)
    pub address: String,
    /// Credential presented on every upstream call
    pub token: String,
    /// Optional raw content-streaming address (`host:port`) for the packet transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub id: BuilderId,
    pub architecture: Architecture,
    pub platforms: Vec<String>,
    pub address: String,
    pub token: String,
    pub state: BuilderState,
    pub last_activity: DateTime<Utc>,
}

impl Builder {
    /// A freshly acquired builder, already booting.
    pub fn booting(architecture: Architecture, endpoint: &BuilderEndpoint) -> Self {
        let platforms = worker_platforms(architecture.as_str())
            .into_iter()
            .map(|p| match p.variant {
                Some(variant) => format!("{}/{}/{}", p.os, p.architecture, variant),
                None => format!("{}/{}", p.os, p.architecture),
            })
            .collect();

        Self {
            id: endpoint.builder_id.clone(),
            architecture,
            platforms,
            address: endpoint.address.clone(),
            token: endpoint.token.clone(),
            state: BuilderState::Booting,
            last_activity: Utc::now(),
        }
    }

    pub fn transition(&mut self, next: BuilderState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                builder: self.id.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_ready(&self) -> bool {
        self.state == BuilderState::Ready
    }
}
