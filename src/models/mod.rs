//! Data models for agent positions, follow plans, and mirror events.

mod event;
mod plan;
mod position;

pub use event::{EventKind, MirrorEvent};
pub use plan::{FollowAction, FollowPlan};
pub use position::{leveraged_return_pct, AgentPosition, ExitPlan, PositionSide};
