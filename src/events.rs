//! Property-change notification.
//!
//! The original models each mutable region attribute as a node in a deep
//! class hierarchy, firing a signal/slot per-property on every mutation.
//! That doesn't translate cleanly: we collapse it to a single change-set
//! value — a bitmask of property tags — plus a subscription list keyed by
//! tag, per the re-architecture note in [`crate::region`]'s module docs.

use parking_lot::Mutex;

/// One bit per mutable region attribute that triggers a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PropertyChange(u32);

impl PropertyChange {
    pub const POSITION: PropertyChange = PropertyChange(1 << 0);
    pub const LENGTH: PropertyChange = PropertyChange(1 << 1);
    pub const START: PropertyChange = PropertyChange(1 << 2);
    pub const SCALE_AMPLITUDE: PropertyChange = PropertyChange(1 << 3);
    pub const ENVELOPE: PropertyChange = PropertyChange(1 << 4);
    pub const FADE_IN: PropertyChange = PropertyChange(1 << 5);
    pub const FADE_OUT: PropertyChange = PropertyChange(1 << 6);
    pub const FADE_BEFORE_FX: PropertyChange = PropertyChange(1 << 7);
    pub const PLUGINS: PropertyChange = PropertyChange(1 << 8);
    pub const NONE: PropertyChange = PropertyChange(0);

    pub fn contains(&self, tag: PropertyChange) -> bool {
        self.0 & tag.0 == tag.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PropertyChange {
    type Output = PropertyChange;
    fn bitor(self, rhs: PropertyChange) -> PropertyChange {
        PropertyChange(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PropertyChange {
    fn bitor_assign(&mut self, rhs: PropertyChange) {
        self.0 |= rhs.0;
    }
}

type Listener = Box<dyn Fn(PropertyChange) + Send + Sync>;

/// A tag-keyed subscription list. Region state holds one of these; callers
/// subscribe to be told which properties changed without needing a distinct
/// signal per attribute.
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: Mutex<Vec<Listener>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(PropertyChange) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    pub fn notify(&self, change: PropertyChange) {
        if change.is_empty() {
            return;
        }
        for listener in self.listeners.lock().iter() {
            listener(change);
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("listener_count", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn notifies_subscribers_with_combined_tags() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        notifier.subscribe(move |change| {
            if change.contains(PropertyChange::FADE_IN) {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        });

        notifier.notify(PropertyChange::FADE_IN | PropertyChange::SCALE_AMPLITUDE);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_change_does_not_notify() {
        let notifier = ChangeNotifier::new();
        let called = Arc::new(AtomicU32::new(0));
        let called2 = called.clone();
        notifier.subscribe(move |_| {
            called2.fetch_add(1, Ordering::SeqCst);
        });
        notifier.notify(PropertyChange::NONE);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}
