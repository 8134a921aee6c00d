//! Safety interlock.
//!
//! Pure decision functions over published state snapshots. The channel
//! controllers evaluate them every cycle; the supervisor exposes them for
//! monitoring. They never touch hardware and never fail.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::controller::{ChamberState, ChannelState, Health};
use crate::instrument::DoorState;

/// Whether a channel may carry bias right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "permission", content = "reason")]
pub enum BiasPermission {
    /// Bias may be applied or raised
    Permitted,
    /// Conditions are safe but the chamber has not settled: existing bias may
    /// stay, a new ramp must not start
    AwaitingStability,
    /// Bias must be removed, with the reason
    Denied(String),
}

impl BiasPermission {
    /// True for [`BiasPermission::Denied`].
    pub fn is_denied(&self) -> bool {
        matches!(self, BiasPermission::Denied(_))
    }
}

impl fmt::Display for BiasPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BiasPermission::Permitted => f.write_str("permitted"),
            BiasPermission::AwaitingStability => f.write_str("awaiting chamber stability"),
            BiasPermission::Denied(reason) => write!(f, "denied: {reason}"),
        }
    }
}

/// Per-channel permissions.
pub type InterlockDecision = BTreeMap<String, BiasPermission>;

/// Chamber-side reason biasing is not allowed, if any.
fn chamber_denial(chamber: &ChamberState) -> Option<String> {
    match chamber.door {
        DoorState::Closed => {}
        DoorState::Open => return Some("chamber door open".into()),
        DoorState::Unknown => return Some("chamber door state unknown".into()),
    }
    if chamber.health == Health::Tripped {
        return Some("chamber tripped".into());
    }
    None
}

/// True if the chamber side allows a tripped channel to be re-armed.
pub fn chamber_clear(chamber: &ChamberState) -> bool {
    chamber_denial(chamber).is_none()
}

/// Permission for one channel.
pub fn channel_permission(chamber: &ChamberState, channel: &ChannelState) -> BiasPermission {
    if let Some(reason) = chamber_denial(chamber) {
        return BiasPermission::Denied(reason);
    }
    if channel.health == Health::Tripped {
        return BiasPermission::Denied(format!("channel {} tripped", channel.id));
    }
    if !chamber.stable {
        return BiasPermission::AwaitingStability;
    }
    BiasPermission::Permitted
}

/// Permissions for every channel.
pub fn evaluate(chamber: &ChamberState, channels: &[ChannelState]) -> InterlockDecision {
    channels
        .iter()
        .map(|channel| (channel.id.clone(), channel_permission(chamber, channel)))
        .collect()
}
