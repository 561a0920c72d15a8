//! Gateway forwarding engine
//!
//! Per-frame ordering is fixed: loop check, display block, route resolution,
//! per-destination block, modification, forward. A frame is forwarded at
//! most once per receive event. Dynamic-block ids advance only on the tick
//! task; the forwarding path reads them through atomics.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{DynamicBlock, GatewayConfig, RuleError};
use crate::frame::{Frame, GatewayAction};

/// Outcome of pushing one frame through the gateway.
#[derive(Debug, Clone)]
pub struct GatewayVerdict {
    /// The received frame annotated with the gateway action, for display.
    pub annotated: Frame,
    /// Whether the observer should see the frame at all.
    pub display: bool,
    /// Transformed copy to transmit, with its destination channel.
    pub forward: Option<(String, Frame)>,
}

struct DynamicBlockState {
    rule: DynamicBlock,
    current_id: AtomicU32,
}

/// Gateway engine: immutable rule set plus dynamic-block cursors.
pub struct GatewayEngine {
    config: GatewayConfig,
    dynamic: Vec<Arc<DynamicBlockState>>,
    running: Arc<AtomicBool>,
}

impl GatewayEngine {
    /// Build an engine over a validated configuration. Invalid rules are
    /// rejected here so the forwarding path stays total.
    pub fn new(config: GatewayConfig) -> Result<Self, RuleError> {
        config.validate()?;
        let dynamic = config
            .dynamic_blocks
            .iter()
            .map(|rule| {
                Arc::new(DynamicBlockState {
                    current_id: AtomicU32::new(rule.id_from),
                    rule: rule.clone(),
                })
            })
            .collect();
        Ok(Self {
            config,
            dynamic,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Currently blocked id of each enabled dynamic block.
    pub fn dynamic_blocked_ids(&self) -> Vec<u32> {
        self.dynamic
            .iter()
            .filter(|s| s.rule.enabled)
            .map(|s| s.current_id.load(Ordering::Relaxed))
            .collect()
    }

    fn dynamic_blocks_frame(&self, frame: &Frame) -> bool {
        self.dynamic.iter().any(|state| {
            state.rule.enabled
                && state.rule.channel == frame.source()
                && frame.can_id() == state.current_id.load(Ordering::Relaxed)
        })
    }

    fn blocks_display(&self, frame: &Frame) -> bool {
        self.config
            .block_rules
            .iter()
            .any(|rule| rule.blocks_display(frame.can_id(), frame.source()))
            || self.dynamic_blocks_frame(frame)
    }

    fn blocks_forward(&self, frame: &Frame, target: &str) -> bool {
        self.config
            .block_rules
            .iter()
            .any(|rule| rule.matches(frame.can_id(), frame.source(), Some(target)))
            || self.dynamic_blocks_frame(frame)
    }

    /// Run one frame through the gateway.
    pub fn process(&self, frame: &Frame) -> GatewayVerdict {
        if !self.config.enabled {
            return GatewayVerdict {
                annotated: frame.clone(),
                display: true,
                forward: None,
            };
        }

        // 1. Loop check: routed frames stop at the hop limit. They are not
        //    dropped from display.
        if self.config.loop_prevention_enabled
            && frame.already_routed()
            && frame.hop_count() >= self.config.max_hops
        {
            debug!(id = frame.can_id(), hops = frame.hop_count(), "loop prevented");
            return GatewayVerdict {
                annotated: frame.clone().with_gateway_action(GatewayAction::LoopPrevented),
                display: true,
                forward: None,
            };
        }

        // 2. Display block.
        let display = !self.blocks_display(frame);

        // 3. Route resolution.
        let Some(destination) = self.config.destination_for(frame.source()) else {
            let annotated = if display {
                frame.clone()
            } else {
                frame.clone().with_gateway_action(GatewayAction::Blocked)
            };
            return GatewayVerdict { annotated, display, forward: None };
        };

        // 4. Per-destination block: do not forward, but still show.
        if self.blocks_forward(frame, destination) {
            return GatewayVerdict {
                annotated: frame.clone().with_gateway_action(GatewayAction::Blocked),
                display,
                forward: None,
            };
        }

        // 5. Modification: first matching rule wins; DLC unchanged.
        let (outgoing, action) = match self
            .config
            .modify_rule_for(frame.can_id(), frame.source(), Some(destination))
        {
            Some(rule) => {
                let new_id = rule.new_id.unwrap_or_else(|| frame.can_id());
                let new_data = rule.apply_data(frame.data());
                (
                    frame.clone().with_replaced(new_id, new_data),
                    GatewayAction::Modified,
                )
            }
            None => (frame.clone(), GatewayAction::Forwarded),
        };

        // 6. Forward exactly one copy.
        let forwarded = outgoing.with_routed_hop(action);
        GatewayVerdict {
            annotated: frame.clone().with_gateway_action(action),
            display,
            forward: Some((destination.to_string(), forwarded)),
        }
    }

    /// Spawn one tick task per enabled dynamic block. Each task advances its
    /// block's `current_id` through `[id_from, id_to]`, wrapping, at the
    /// block's own period. The receive path never advances ids.
    pub fn spawn_tickers(&self) -> Vec<JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);
        self.dynamic
            .iter()
            .filter(|s| s.rule.enabled)
            .cloned()
            .map(|state| {
                let running = Arc::clone(&self.running);
                tokio::spawn(async move {
                    let period = std::time::Duration::from_millis(state.rule.period_ms.max(1));
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    // The first tick completes immediately.
                    interval.tick().await;
                    info!(
                        from = state.rule.id_from,
                        to = state.rule.id_to,
                        channel = %state.rule.channel,
                        "dynamic block ticker started"
                    );
                    while running.load(Ordering::SeqCst) {
                        interval.tick().await;
                        let current = state.current_id.load(Ordering::Relaxed);
                        let next = if current >= state.rule.id_to {
                            state.rule.id_from
                        } else {
                            current + 1
                        };
                        state.current_id.store(next, Ordering::Relaxed);
                    }
                })
            })
            .collect()
    }

    /// Stop all tick tasks at their next tick.
    pub fn stop_tickers(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Advance every enabled dynamic block once. Test and tooling hook; the
    /// runtime path is the ticker.
    pub fn tick_dynamic_blocks(&self) {
        for state in self.dynamic.iter().filter(|s| s.rule.enabled) {
            let current = state.current_id.load(Ordering::Relaxed);
            let next = if current >= state.rule.id_to {
                state.rule.id_from
            } else {
                current + 1
            };
            state.current_id.store(next, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{BlockRule, GatewayRoute, ModifyRule};

    fn frame(can_id: u32, source: &str) -> Frame {
        Frame::new(1.0, can_id, vec![1, 2, 3, 4], false, source).unwrap()
    }

    fn two_way_config() -> GatewayConfig {
        GatewayConfig {
            routes: vec![
                GatewayRoute { source: "CAN1".into(), destination: "CAN2".into(), enabled: true },
                GatewayRoute { source: "CAN2".into(), destination: "CAN1".into(), enabled: true },
            ],
            enabled: true,
            loop_prevention_enabled: true,
            max_hops: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_and_loop_prevention() {
        // CAN1 <-> CAN2 both ways with max_hops 1.
        let engine = GatewayEngine::new(two_way_config()).unwrap();

        let verdict = engine.process(&frame(0x123, "CAN1"));
        let (dest, forwarded) = verdict.forward.expect("must forward once");
        assert_eq!(dest, "CAN2");
        assert!(forwarded.already_routed());
        assert_eq!(forwarded.hop_count(), 1);
        assert_eq!(forwarded.gateway_action(), GatewayAction::Forwarded);
        assert!(verdict.display);

        // The forwarded frame arrives back on CAN2's receive path.
        let echoed = forwarded.with_source("CAN2");
        let verdict = engine.process(&echoed);
        assert!(verdict.forward.is_none());
        assert_eq!(verdict.annotated.gateway_action(), GatewayAction::LoopPrevented);
        assert!(verdict.display);
    }

    #[test]
    fn test_disabled_gateway_is_passthrough() {
        let mut config = two_way_config();
        config.enabled = false;
        let engine = GatewayEngine::new(config).unwrap();

        let verdict = engine.process(&frame(0x123, "CAN1"));
        assert!(verdict.display);
        assert!(verdict.forward.is_none());
        assert_eq!(verdict.annotated.gateway_action(), GatewayAction::None);
    }

    #[test]
    fn test_display_block_suppresses_and_blocks() {
        let mut config = two_way_config();
        config.block_rules.push(BlockRule {
            can_id: 0x123,
            channel: "CAN1".into(),
            enabled: true,
            destination: None,
            block_display: true,
        });
        let engine = GatewayEngine::new(config).unwrap();

        let verdict = engine.process(&frame(0x123, "CAN1"));
        assert!(!verdict.display);
        assert!(verdict.forward.is_none());
        assert_eq!(verdict.annotated.gateway_action(), GatewayAction::Blocked);

        // Other ids keep flowing.
        let verdict = engine.process(&frame(0x124, "CAN1"));
        assert!(verdict.display);
        assert!(verdict.forward.is_some());
    }

    #[test]
    fn test_destination_block_still_shows() {
        let mut config = two_way_config();
        config.block_rules.push(BlockRule {
            can_id: 0x123,
            channel: "CAN1".into(),
            enabled: true,
            destination: Some("CAN2".into()),
            block_display: false,
        });
        let engine = GatewayEngine::new(config).unwrap();

        let verdict = engine.process(&frame(0x123, "CAN1"));
        assert!(verdict.display, "per-destination blocks do not hide frames");
        assert!(verdict.forward.is_none());
        assert_eq!(verdict.annotated.gateway_action(), GatewayAction::Blocked);
    }

    #[test]
    fn test_modify_rule_rewrites_frame() {
        let mut config = two_way_config();
        let mut rule = ModifyRule {
            can_id: 0x123,
            channel: "CAN1".into(),
            enabled: true,
            destination: None,
            new_id: Some(0x321),
            data_mask: [false; 8],
            new_data: [0; 8],
        };
        rule.data_mask[1] = true;
        rule.new_data[1] = 0xEE;
        config.modify_rules.push(rule);
        let engine = GatewayEngine::new(config).unwrap();

        let verdict = engine.process(&frame(0x123, "CAN1"));
        let (_, forwarded) = verdict.forward.unwrap();
        assert_eq!(forwarded.can_id(), 0x321);
        assert_eq!(forwarded.data(), &[1, 0xEE, 3, 4]);
        assert_eq!(forwarded.dlc(), 4);
        assert_eq!(forwarded.gateway_action(), GatewayAction::Modified);
        assert_eq!(verdict.annotated.gateway_action(), GatewayAction::Modified);
    }

    #[test]
    fn test_invalid_modify_rule_rejected_at_install() {
        let mut config = two_way_config();
        config.modify_rules.push(ModifyRule {
            can_id: 0x123,
            channel: "CAN1".into(),
            enabled: true,
            destination: None,
            new_id: Some(0x2000_0000),
            data_mask: [false; 8],
            new_data: [0; 8],
        });
        assert!(GatewayEngine::new(config).is_err());
    }

    #[test]
    fn test_dynamic_block_advances_and_wraps() {
        let mut config = two_way_config();
        config.dynamic_blocks.push(DynamicBlock {
            id_from: 0x100,
            id_to: 0x102,
            channel: "CAN1".into(),
            period_ms: 50,
            enabled: true,
        });
        let engine = GatewayEngine::new(config).unwrap();

        assert_eq!(engine.dynamic_blocked_ids(), vec![0x100]);
        let verdict = engine.process(&frame(0x100, "CAN1"));
        assert!(!verdict.display);
        assert!(verdict.forward.is_none());

        engine.tick_dynamic_blocks();
        assert_eq!(engine.dynamic_blocked_ids(), vec![0x101]);
        // Previously blocked id flows again.
        assert!(engine.process(&frame(0x100, "CAN1")).forward.is_some());

        engine.tick_dynamic_blocks();
        engine.tick_dynamic_blocks();
        assert_eq!(engine.dynamic_blocked_ids(), vec![0x100], "wraps to id_from");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_advances_on_schedule() {
        let mut config = two_way_config();
        config.dynamic_blocks.push(DynamicBlock {
            id_from: 0x200,
            id_to: 0x2FF,
            channel: "CAN1".into(),
            period_ms: 100,
            enabled: true,
        });
        let engine = GatewayEngine::new(config).unwrap();
        let handles = engine.spawn_tickers();
        assert_eq!(handles.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let current = engine.dynamic_blocked_ids()[0];
        assert!(current > 0x200, "ticker advanced, current=0x{current:X}");

        engine.stop_tickers();
    }

    #[test]
    fn test_single_forward_per_receive_event() {
        // Two enabled routes from the same source are resolved to the first:
        // a frame never fans out to more than one destination.
        let mut config = two_way_config();
        config.routes.push(GatewayRoute {
            source: "CAN1".into(),
            destination: "CAN3".into(),
            enabled: true,
        });
        let engine = GatewayEngine::new(config).unwrap();
        let verdict = engine.process(&frame(0x123, "CAN1"));
        let (dest, _) = verdict.forward.unwrap();
        assert_eq!(dest, "CAN2");
    }
}
