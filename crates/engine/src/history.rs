use shared::protocol::HistoryEntry;

/// Single global undo/redo pair, in commit order across all registrations.
///
/// Only direct edits (and resets / accepted suggestions) push here; the
/// mutations applied by undo and redo themselves push onto the opposite
/// stack instead, so the two never feed back into each other.
#[derive(Default)]
pub struct HistoryStacks {
    undo: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

impl HistoryStacks {
    /// Records a fresh edit. Any pending redo chain is invalidated.
    pub fn record_edit(&mut self, entry: HistoryEntry) {
        self.undo.push(entry);
        self.redo.clear();
    }

    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.undo.pop()
    }

    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        self.redo.pop()
    }

    pub fn push_redo(&mut self, entry: HistoryEntry) {
        self.redo.push(entry);
    }

    pub fn push_undo_from_redo(&mut self, entry: HistoryEntry) {
        self.undo.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::domain::RegistrationId;

    fn entry(old: i64, new: i64) -> HistoryEntry {
        HistoryEntry {
            registration_id: RegistrationId::new("hero"),
            key: "padding".into(),
            old_value: json!(old),
            new_value: json!(new),
        }
    }

    #[test]
    fn fresh_edit_clears_redo() {
        let mut stacks = HistoryStacks::default();
        stacks.record_edit(entry(10, 20));
        let undone = stacks.pop_undo().expect("entry");
        stacks.push_redo(undone);
        assert!(stacks.pop_redo().is_some());

        stacks.record_edit(entry(10, 30));
        stacks.push_redo(entry(10, 30));
        stacks.record_edit(entry(30, 40));
        assert!(stacks.pop_redo().is_none());
    }

    #[test]
    fn redo_path_does_not_clear_itself() {
        let mut stacks = HistoryStacks::default();
        stacks.record_edit(entry(10, 20));
        stacks.record_edit(entry(20, 30));
        for _ in 0..2 {
            let undone = stacks.pop_undo().expect("entry");
            stacks.push_redo(undone);
        }

        let redone = stacks.pop_redo().expect("entry");
        stacks.push_undo_from_redo(redone);
        // Moving one entry back must not wipe the remaining redo chain.
        assert!(stacks.pop_redo().is_some());
    }
}
