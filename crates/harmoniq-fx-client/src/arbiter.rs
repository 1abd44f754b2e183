//! Priority based control arbitration for one shared engine instance.

use tracing::trace;

use crate::ids::{AttachmentId, Priority};

/// A single control transition to report to an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlChange {
    pub attachment: AttachmentId,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub attachment: AttachmentId,
    pub changes: Vec<ControlChange>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: AttachmentId,
    priority: Priority,
}

/// Tracks attachments of one engine instance and which of them is in control.
///
/// Entries are kept in attach order, which doubles as the tie-break: among
/// equal priorities the earliest attachment wins.
#[derive(Debug, Default)]
pub struct ControlArbiter {
    entries: Vec<Entry>,
    probes: Vec<AttachmentId>,
    controller: Option<AttachmentId>,
}

impl ControlArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, priority: Priority, probe: bool) -> Attached {
        let id = AttachmentId::next();
        if probe {
            self.probes.push(id);
            return Attached {
                attachment: id,
                changes: Vec::new(),
            };
        }

        self.entries.push(Entry { id, priority });
        let takes_control = match self.controller.and_then(|c| self.priority_of(c)) {
            Some(current) => priority > current,
            None => true,
        };
        let changes = if takes_control {
            self.transfer(Some(id))
        } else {
            Vec::new()
        };
        trace!(attachment = %id, priority = priority.0, takes_control, "attached");
        Attached {
            attachment: id,
            changes,
        }
    }

    pub fn detach(&mut self, id: AttachmentId) -> Vec<ControlChange> {
        if let Some(pos) = self.probes.iter().position(|p| *p == id) {
            self.probes.remove(pos);
            return Vec::new();
        }
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return Vec::new();
        };
        self.entries.remove(pos);
        if self.controller != Some(id) {
            return Vec::new();
        }
        let next = self.highest();
        self.transfer(next)
    }

    /// Drop every attachment, as when the engine instance is destroyed.
    pub fn clear(&mut self) -> Vec<ControlChange> {
        let changes = self.transfer(None);
        self.entries.clear();
        self.probes.clear();
        changes
    }

    pub fn current_controller(&self) -> Option<AttachmentId> {
        self.controller
    }

    pub fn is_controller(&self, id: AttachmentId) -> bool {
        self.controller == Some(id)
    }

    pub fn priority_of(&self, id: AttachmentId) -> Option<Priority> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.priority)
    }

    pub fn contains(&self, id: AttachmentId) -> bool {
        self.entries.iter().any(|e| e.id == id) || self.probes.contains(&id)
    }

    /// Number of arbitrated (non-probe) attachments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attachments ordered by descending priority, earliest first on ties.
    pub fn attachments(&self) -> Vec<(AttachmentId, Priority)> {
        let mut ordered: Vec<_> = self.entries.iter().map(|e| (e.id, e.priority)).collect();
        // stable sort keeps attach order within a priority
        ordered.sort_by(|a, b| b.1.cmp(&a.1));
        ordered
    }

    fn highest(&self) -> Option<AttachmentId> {
        let mut best: Option<Entry> = None;
        for entry in &self.entries {
            match best {
                Some(b) if entry.priority <= b.priority => {}
                _ => best = Some(*entry),
            }
        }
        best.map(|e| e.id)
    }

    fn transfer(&mut self, next: Option<AttachmentId>) -> Vec<ControlChange> {
        let previous = std::mem::replace(&mut self.controller, next);
        if previous == next {
            return Vec::new();
        }
        let mut changes = Vec::with_capacity(2);
        if let Some(lost) = previous {
            changes.push(ControlChange {
                attachment: lost,
                granted: false,
            });
        }
        if let Some(gained) = next {
            changes.push(ControlChange {
                attachment: gained,
                granted: true,
            });
        }
        changes
    }
}
