use crate::types::RoomEvent;

/// In-memory room timeline with bounded item retention.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineBuffer {
    items: Vec<RoomEvent>,
    max_items: usize,
}

impl TimelineBuffer {
    /// Create a timeline buffer with an item cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
        }
    }

    /// Current timeline items, oldest first.
    pub fn items(&self) -> &[RoomEvent] {
        &self.items
    }

    /// Append an event, evicting the oldest ones past the cap.
    pub fn push(&mut self, event: RoomEvent) {
        self.items.push(event);
        self.trim_to_max();
    }

    fn trim_to_max(&mut self) {
        if self.items.len() <= self.max_items {
            return;
        }

        let excess = self.items.len() - self.max_items;
        self.items.drain(0..excess);
    }
}
