//! CAN gateway configuration: routes, block rules, dynamic blocks, and
//! modification rules
//!
//! Rules are validated when installed; the runtime forwarding path never
//! fails.

pub mod engine;

pub use engine::{GatewayEngine, GatewayVerdict};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{EXT_ID_MAX, STD_ID_MAX};

/// Rule rejected at install time.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("new_id 0x{0:X} out of identifier range")]
    NewIdOutOfRange(u32),
    #[error("new_id 0x{new_id:X} does not fit the 11-bit domain of can_id 0x{can_id:X}")]
    NewIdDomainMismatch { can_id: u32, new_id: u32 },
    #[error("dynamic block range 0x{0:X}..0x{1:X} is inverted")]
    InvertedIdRange(u32, u32),
    #[error("rule can_id 0x{0:X} out of identifier range")]
    CanIdOutOfRange(u32),
}

/// Forwarding route between two named channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRoute {
    pub source: String,
    pub destination: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Static blocking rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRule {
    pub can_id: u32,
    /// Source channel the rule applies to.
    pub channel: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When set, the rule only blocks forwarding toward this destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// When true, matching frames are also hidden from the observer.
    #[serde(default = "default_true")]
    pub block_display: bool,
}

impl BlockRule {
    /// Whether a frame from `channel` heading to `target` is blocked.
    pub fn matches(&self, can_id: u32, channel: &str, target: Option<&str>) -> bool {
        if !self.enabled || self.can_id != can_id || self.channel != channel {
            return false;
        }
        match (&self.destination, target) {
            (Some(rule_dest), Some(target)) => rule_dest == target,
            // No destination on the rule: block for all routes.
            _ => true,
        }
    }

    /// Display suppression is destination-less: only rules without a
    /// destination hide frames from the observer.
    pub fn blocks_display(&self, can_id: u32, channel: &str) -> bool {
        self.enabled
            && self.block_display
            && self.destination.is_none()
            && self.can_id == can_id
            && self.channel == channel
    }
}

/// Dynamic incrementing block: one id out of `[id_from, id_to]` is blocked
/// at a time, advancing on the gateway tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicBlock {
    pub id_from: u32,
    pub id_to: u32,
    pub channel: String,
    /// Blocking time per id in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default)]
    pub enabled: bool,
}

impl DynamicBlock {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id_to < self.id_from {
            return Err(RuleError::InvertedIdRange(self.id_from, self.id_to));
        }
        if self.id_to > EXT_ID_MAX {
            return Err(RuleError::CanIdOutOfRange(self.id_to));
        }
        Ok(())
    }
}

/// Frame modification rule: optional id replacement plus per-byte masked
/// data replacement. DLC is never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyRule {
    pub can_id: u32,
    pub channel: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_id: Option<u32>,
    /// Which payload bytes to replace.
    #[serde(default)]
    pub data_mask: [bool; 8],
    /// Replacement values for masked bytes.
    #[serde(default)]
    pub new_data: [u8; 8],
}

impl ModifyRule {
    pub fn matches(&self, can_id: u32, channel: &str, target: Option<&str>) -> bool {
        if !self.enabled || self.can_id != can_id || self.channel != channel {
            return false;
        }
        match (&self.destination, target) {
            (Some(rule_dest), Some(target)) => rule_dest == target,
            _ => true,
        }
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.can_id > EXT_ID_MAX {
            return Err(RuleError::CanIdOutOfRange(self.can_id));
        }
        if let Some(new_id) = self.new_id {
            if new_id > EXT_ID_MAX {
                return Err(RuleError::NewIdOutOfRange(new_id));
            }
            // An 11-bit rule must stay inside the 11-bit domain.
            if self.can_id <= STD_ID_MAX && new_id > STD_ID_MAX {
                return Err(RuleError::NewIdDomainMismatch { can_id: self.can_id, new_id });
            }
        }
        Ok(())
    }

    /// Replacement payload for a matched frame.
    pub fn apply_data(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        for (i, byte) in out.iter_mut().enumerate() {
            if self.data_mask.get(i).copied().unwrap_or(false) {
                *byte = self.new_data[i];
            }
        }
        out
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub routes: Vec<GatewayRoute>,
    #[serde(default)]
    pub block_rules: Vec<BlockRule>,
    #[serde(default)]
    pub dynamic_blocks: Vec<DynamicBlock>,
    #[serde(default)]
    pub modify_rules: Vec<ModifyRule>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub loop_prevention_enabled: bool,
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            block_rules: Vec::new(),
            dynamic_blocks: Vec::new(),
            modify_rules: Vec::new(),
            enabled: false,
            loop_prevention_enabled: true,
            max_hops: default_max_hops(),
        }
    }
}

impl GatewayConfig {
    /// Destination for a source channel, when an enabled route exists.
    pub fn destination_for(&self, source: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.enabled && r.source == source)
            .map(|r| r.destination.as_str())
    }

    pub fn has_route_from(&self, source: &str) -> bool {
        self.routes.iter().any(|r| r.enabled && r.source == source)
    }

    /// First enabled modify rule matching the frame, if any.
    pub fn modify_rule_for(&self, can_id: u32, channel: &str, target: Option<&str>) -> Option<&ModifyRule> {
        self.modify_rules
            .iter()
            .find(|r| r.matches(can_id, channel, target))
    }

    /// Validate every installed rule. Run before the engine starts.
    pub fn validate(&self) -> Result<(), RuleError> {
        for rule in &self.modify_rules {
            rule.validate()?;
        }
        for block in &self.dynamic_blocks {
            block.validate()?;
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_period_ms() -> u64 {
    1000
}

fn default_max_hops() -> u8 {
    1
}
