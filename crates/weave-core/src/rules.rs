//! Hierarchical sync rules
//!
//! A rule block attached to a scene object scopes per-type policy: whether
//! a type is synchronized at all, separately for send and receive, and at
//! what decimal precision floats are transmitted. Resolution walks the
//! ancestor chain; the nearest applicable block with an opinion wins. A
//! block without an opinion on a type (entry absent or not enabled) is
//! transparent: the walk keeps climbing.

use std::collections::HashMap;

use crate::id::ObjectId;
use crate::scene::Scene;

/// Default decimal precision when no rule resolves one
pub const DEFAULT_DECIMAL_PLACES: u8 = 5;

/// Direction of a synchronization decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Per-type policy inside a rule block
///
/// `enabled = false` means "no opinion", not "deny": resolution falls
/// through to the next ancestor.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleEntry {
    pub enabled: bool,
    pub send: bool,
    pub receive: bool,
    pub decimal_places: Option<u8>,
}

impl RuleEntry {
    /// An opinionated entry allowing both directions
    pub fn allow() -> Self {
        RuleEntry {
            enabled: true,
            send: true,
            receive: true,
            decimal_places: None,
        }
    }

    /// An opinionated entry denying both directions
    pub fn deny() -> Self {
        RuleEntry {
            enabled: true,
            send: false,
            receive: false,
            decimal_places: None,
        }
    }

    pub fn with_places(mut self, places: u8) -> Self {
        self.decimal_places = Some(places);
        self
    }
}

/// A policy block attached to one scene object
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleBlock {
    /// Block applies to the object it is attached to
    pub applies_to_self: bool,
    /// Block applies to descendants of the object it is attached to
    pub applies_to_descendants: bool,
    entries: HashMap<String, RuleEntry>,
}

impl RuleBlock {
    pub fn new(applies_to_self: bool, applies_to_descendants: bool) -> Self {
        RuleBlock {
            applies_to_self,
            applies_to_descendants,
            entries: HashMap::new(),
        }
    }

    pub fn set(&mut self, tag: impl Into<String>, entry: RuleEntry) -> &mut Self {
        self.entries.insert(tag.into(), entry);
        self
    }

    pub fn with(mut self, tag: impl Into<String>, entry: RuleEntry) -> Self {
        self.entries.insert(tag.into(), entry);
        self
    }

    pub fn entry(&self, tag: &str) -> Option<&RuleEntry> {
        self.entries.get(tag)
    }
}

/// Ancestor-walk rule resolution
///
/// When no block on the chain resolves a type, `default_allow` applies to
/// both directions and both objects and resources. The default is allow:
/// a freshly wired peer mirrors everything, restriction is opt-in.
#[derive(Clone, Debug)]
pub struct RuleResolver {
    pub default_allow: bool,
    pub default_places: u8,
}

impl RuleResolver {
    pub fn new() -> Self {
        RuleResolver {
            default_allow: true,
            default_places: DEFAULT_DECIMAL_PLACES,
        }
    }

    pub fn with_default_allow(mut self, allow: bool) -> Self {
        self.default_allow = allow;
        self
    }

    /// Resolve whether `tag` may synchronize in `direction` for the object
    pub fn resolve(&self, scene: &Scene, id: ObjectId, tag: &str, direction: Direction) -> bool {
        let mut current = Some(id);
        let mut at_self = true;
        while let Some(cur) = current {
            let Some(obj) = scene.get(cur) else { break };
            if let Some(block) = &obj.rules {
                let applicable = if at_self {
                    block.applies_to_self
                } else {
                    block.applies_to_descendants
                };
                if applicable {
                    if let Some(entry) = block.entry(tag) {
                        if entry.enabled {
                            return match direction {
                                Direction::Send => entry.send,
                                Direction::Receive => entry.receive,
                            };
                        }
                    }
                }
            }
            current = obj.parent();
            at_self = false;
        }
        self.default_allow
    }

    /// Resolve the decimal precision for `tag` on the object
    pub fn decimal_places(&self, scene: &Scene, id: ObjectId, tag: &str) -> u8 {
        let mut current = Some(id);
        let mut at_self = true;
        while let Some(cur) = current {
            let Some(obj) = scene.get(cur) else { break };
            if let Some(block) = &obj.rules {
                let applicable = if at_self {
                    block.applies_to_self
                } else {
                    block.applies_to_descendants
                };
                if applicable {
                    if let Some(entry) = block.entry(tag) {
                        if entry.enabled {
                            if let Some(places) = entry.decimal_places {
                                return places;
                            }
                        }
                    }
                }
            }
            current = obj.parent();
            at_self = false;
        }
        self.default_places
    }
}

impl Default for RuleResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_with_chain() -> (Scene, ObjectId, ObjectId, ObjectId) {
        let mut scene = Scene::new();
        let top = scene.spawn("top", None);
        let mid = scene.spawn("mid", Some(top));
        let leaf = scene.spawn("leaf", Some(mid));
        (scene, top, mid, leaf)
    }

    #[test]
    fn test_default_is_allow() {
        let (scene, _, _, leaf) = scene_with_chain();
        let resolver = RuleResolver::new();
        assert!(resolver.resolve(&scene, leaf, "Transform", Direction::Send));
        assert!(resolver.resolve(&scene, leaf, "Transform", Direction::Receive));
        assert_eq!(
            resolver.decimal_places(&scene, leaf, "Transform"),
            DEFAULT_DECIMAL_PLACES
        );
    }

    #[test]
    fn test_nearest_rule_wins() {
        let (mut scene, top, mid, leaf) = scene_with_chain();
        scene.get_mut(top).unwrap().rules =
            Some(RuleBlock::new(true, true).with("Transform", RuleEntry::allow()));
        scene.get_mut(mid).unwrap().rules =
            Some(RuleBlock::new(false, true).with("Transform", RuleEntry::deny()));

        let resolver = RuleResolver::new();
        // leaf sees mid's descendant-scoped deny before top's allow
        assert!(!resolver.resolve(&scene, leaf, "Transform", Direction::Send));
        // mid's own block does not apply to itself; top's allow wins
        assert!(resolver.resolve(&scene, mid, "Transform", Direction::Send));
    }

    #[test]
    fn test_disabled_entry_is_transparent() {
        let (mut scene, top, _, leaf) = scene_with_chain();
        let mut transparent = RuleEntry::deny();
        transparent.enabled = false;
        scene.get_mut(leaf).unwrap().rules =
            Some(RuleBlock::new(true, false).with("Transform", transparent));
        scene.get_mut(top).unwrap().rules =
            Some(RuleBlock::new(false, true).with("Transform", RuleEntry::deny()));

        let resolver = RuleResolver::new();
        // leaf's not-enabled entry keeps climbing and hits top's deny
        assert!(!resolver.resolve(&scene, leaf, "Transform", Direction::Send));
    }

    #[test]
    fn test_self_flag_gates_own_block() {
        let (mut scene, _, _, leaf) = scene_with_chain();
        scene.get_mut(leaf).unwrap().rules =
            Some(RuleBlock::new(false, true).with("Light", RuleEntry::deny()));

        let resolver = RuleResolver::new();
        // applies_to_self is false, so the block has no say on leaf itself
        assert!(resolver.resolve(&scene, leaf, "Light", Direction::Receive));
    }

    #[test]
    fn test_send_receive_split() {
        let (mut scene, _, _, leaf) = scene_with_chain();
        let entry = RuleEntry {
            enabled: true,
            send: true,
            receive: false,
            decimal_places: Some(2),
        };
        scene.get_mut(leaf).unwrap().rules =
            Some(RuleBlock::new(true, false).with("Transform", entry));

        let resolver = RuleResolver::new();
        assert!(resolver.resolve(&scene, leaf, "Transform", Direction::Send));
        assert!(!resolver.resolve(&scene, leaf, "Transform", Direction::Receive));
        assert_eq!(resolver.decimal_places(&scene, leaf, "Transform"), 2);
    }
}
