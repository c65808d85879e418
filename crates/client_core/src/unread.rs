/// Process-wide unread counters for the two independent notification
/// domains: direct messages and social notifications.
///
/// Seeded once per session from the REST count endpoint; afterwards
/// mutated by channel pushes (overwrites and increments) and by local
/// read detection (saturating decrements). There is no cross-validation
/// between the two counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnreadCounters {
    messages: u32,
    notifications: u32,
}

impl UnreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> u32 {
        self.messages
    }

    pub fn notifications(&self) -> u32 {
        self.notifications
    }

    /// Authoritative overwrite, used by the session-start seed and by
    /// `unreadMessagesCount` / `unreadCountResponse` pushes.
    pub fn set_messages(&mut self, count: u32) {
        self.messages = count;
    }

    pub fn set_notifications(&mut self, count: u32) {
        self.notifications = count;
    }

    pub fn increment_messages(&mut self) {
        self.messages = self.messages.saturating_add(1);
    }

    pub fn increment_notifications(&mut self) {
        self.notifications = self.notifications.saturating_add(1);
    }

    /// Decrements the message counter by `n`, flooring at zero. The
    /// floor matters: a fetch-merge can mark messages read that the
    /// counter never accounted for.
    pub fn decrement_messages(&mut self, n: u32) {
        self.messages = self.messages.saturating_sub(n);
    }

    pub fn reset_messages(&mut self) {
        self.messages = 0;
    }

    pub fn reset_notifications(&mut self) {
        self.notifications = 0;
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
