//! Edge subscriptions
//!
//! Each (flag, edge) pair carries two kinds of subscribers: repeating hooks
//! that run on every matching edge, and one-shot hooks that run on the first
//! matching edge and are then discarded. Registration returns a
//! [`HookToken`] that can cancel the subscription before it fires.

use std::sync::Arc;

use super::model::{Edge, EdgeEvent, EvseFlag};

pub type RepeatingHook = Arc<dyn Fn(&EdgeEvent) + Send + Sync>;
pub type OneShotHook = Box<dyn FnOnce(&EdgeEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookToken(u64);

struct Repeating {
    token: HookToken,
    flag: EvseFlag,
    edge: Edge,
    hook: RepeatingHook,
}

struct OneShot {
    token: HookToken,
    flag: EvseFlag,
    edge: Edge,
    hook: OneShotHook,
}

#[derive(Default)]
pub struct EdgeHooks {
    next_token: u64,
    repeating: Vec<Repeating>,
    one_shot: Vec<OneShot>,
}

impl EdgeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue_token(&mut self) -> HookToken {
        self.next_token += 1;
        HookToken(self.next_token)
    }

    pub fn on_edge(&mut self, flag: EvseFlag, edge: Edge, hook: RepeatingHook) -> HookToken {
        let token = self.issue_token();
        self.repeating.push(Repeating {
            token,
            flag,
            edge,
            hook,
        });
        token
    }

    pub fn once(&mut self, flag: EvseFlag, edge: Edge, hook: OneShotHook) -> HookToken {
        let token = self.issue_token();
        self.one_shot.push(OneShot {
            token,
            flag,
            edge,
            hook,
        });
        token
    }

    /// Remove a subscription. Returns `false` if it already fired or was
    /// never registered.
    pub fn cancel(&mut self, token: HookToken) -> bool {
        let before = self.repeating.len() + self.one_shot.len();
        self.repeating.retain(|r| r.token != token);
        self.one_shot.retain(|o| o.token != token);
        before != self.repeating.len() + self.one_shot.len()
    }

    /// Collect the hooks matching `event`. One-shot hooks are removed here,
    /// so a second call for the same edge will not return them again.
    pub fn take_fired(&mut self, event: &EdgeEvent) -> FiredHooks {
        let repeating = self
            .repeating
            .iter()
            .filter(|r| r.flag == event.flag && r.edge == event.edge)
            .map(|r| r.hook.clone())
            .collect();

        let mut one_shot = Vec::new();
        let mut kept = Vec::with_capacity(self.one_shot.len());
        for entry in self.one_shot.drain(..) {
            if entry.flag == event.flag && entry.edge == event.edge {
                one_shot.push(entry.hook);
            } else {
                kept.push(entry);
            }
        }
        self.one_shot = kept;

        FiredHooks {
            event: *event,
            repeating,
            one_shot,
        }
    }

    pub fn pending_one_shots(&self) -> usize {
        self.one_shot.len()
    }
}

/// Hooks detached from the registry, ready to run outside any lock.
pub struct FiredHooks {
    event: EdgeEvent,
    repeating: Vec<RepeatingHook>,
    one_shot: Vec<OneShotHook>,
}

impl FiredHooks {
    pub fn is_empty(&self) -> bool {
        self.repeating.is_empty() && self.one_shot.is_empty()
    }

    /// Repeating hooks run before one-shot hooks.
    pub fn run(self) {
        for hook in &self.repeating {
            hook(&self.event);
        }
        for hook in self.one_shot {
            hook(&self.event);
        }
    }
}
