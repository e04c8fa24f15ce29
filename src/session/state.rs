//! Session state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one tenant's protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No connection has ever been attempted.
    #[default]
    Uninitialized,
    /// Transport connection is being opened.
    Initializing,
    /// A pairing code was issued and the tenant has not scanned it yet.
    AwaitingPairing,
    /// Paired and online.
    Connected,
    /// Lost the connection, a reconnect is scheduled or in flight.
    Reconnecting,
    /// Torn down on purpose or logged out.
    Disconnected,
    /// Gave up. Stays here until an explicit re-initialize.
    Error,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 7] = [
        Self::Uninitialized,
        Self::Initializing,
        Self::AwaitingPairing,
        Self::Connected,
        Self::Reconnecting,
        Self::Disconnected,
        Self::Error,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;

        // Explicit teardown is legal from anywhere, and idempotent.
        if target == Disconnected {
            return true;
        }

        matches!(
            (self, target),
            (Uninitialized, Initializing) |
            (Initializing, AwaitingPairing) | (Initializing, Connected) |
            (Initializing, Reconnecting) | (Initializing, Error) |
            // The protocol refreshes pairing codes while waiting
            (AwaitingPairing, AwaitingPairing) | (AwaitingPairing, Connected) |
            (AwaitingPairing, Reconnecting) | (AwaitingPairing, Error) |
            (Connected, Reconnecting) | (Connected, Error) |
            (Reconnecting, Reconnecting) | (Reconnecting, AwaitingPairing) |
            (Reconnecting, Connected) | (Reconnecting, Error) |
            (Disconnected, Initializing) |
            (Error, Initializing)
        )
    }

    /// States that cannot be trusted across a process restart.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::AwaitingPairing | Self::Reconnecting | Self::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(Self::Uninitialized),
            "initializing" => Ok(Self::Initializing),
            "awaiting_pairing" => Ok(Self::AwaitingPairing),
            "connected" => Ok(Self::Connected),
            "reconnecting" => Ok(Self::Reconnecting),
            "disconnected" => Ok(Self::Disconnected),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}
