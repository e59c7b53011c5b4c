//! Undo/redo history with grouping and per-buffer saved-state tracking.
//!
//! Actions are applied to a target `C` passed into every call (for text
//! editing, a slice of [`TextBuffer`]s), so the history never holds a
//! reference to the buffers it edits. Every undo or redo returns the
//! [`AppliedEdit`]s it made, ready to forward to
//! [`Differ::apply_edit`](crate::differ::Differ::apply_edit) and
//! [`BufferLines::invalidate`](crate::buffer::BufferLines::invalidate).

use std::collections::HashMap;
use std::fmt;

use crate::buffer::{BufferEdit, TextBuffer};
use crate::error::{EngineError, Result};

/// One buffer mutation performed while undoing or redoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedEdit {
    pub buffer: usize,
    pub edit: BufferEdit,
}

pub trait UndoAction<C: ?Sized> {
    /// Index of the buffer this action edits.
    fn buffer(&self) -> usize;
    fn undo(&mut self, target: &mut C) -> Vec<AppliedEdit>;
    fn redo(&mut self, target: &mut C) -> Vec<AppliedEdit>;
}

/// Notifications, emitted only when the value actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoEvent {
    CanUndo(bool),
    CanRedo(bool),
    Checkpointed { buffer: usize, state: bool },
}

type Checkpoint = (Option<usize>, Option<usize>);

pub struct UndoSequence<C: ?Sized> {
    actions: Vec<Box<dyn UndoAction<C>>>,
    next_redo: usize,
    checkpoints: HashMap<usize, Checkpoint>,
    group: Option<Box<UndoSequence<C>>>,
    sinks: Vec<Box<dyn FnMut(&UndoEvent)>>,
}

impl<C: ?Sized> fmt::Debug for UndoSequence<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoSequence")
            .field("actions", &self.actions.len())
            .field("next_redo", &self.next_redo)
            .field("checkpoints", &self.checkpoints)
            .field("grouped", &self.group.is_some())
            .finish()
    }
}

impl<C: ?Sized + 'static> Default for UndoSequence<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized + 'static> UndoSequence<C> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            next_redo: 0,
            checkpoints: HashMap::new(),
            group: None,
            sinks: Vec::new(),
        }
    }

    pub fn connect(&mut self, sink: impl FnMut(&UndoEvent) + 'static) {
        self.sinks.push(Box::new(sink));
    }

    fn emit(&mut self, event: UndoEvent) {
        for sink in &mut self.sinks {
            sink(&event);
        }
    }

    fn checkpoint_states(&self) -> Vec<(usize, bool)> {
        let mut states: Vec<(usize, bool)> = self
            .checkpoints
            .keys()
            .map(|&buffer| (buffer, self.checkpointed(buffer)))
            .collect();
        states.sort_unstable();
        states
    }

    /// Emit `Checkpointed` for every buffer whose state differs from
    /// `before`. Buffers missing from `before` count as not checkpointed.
    fn emit_checkpoint_changes(&mut self, before: &[(usize, bool)]) {
        let was = |buffer: usize| before.iter().any(|&(b, state)| b == buffer && state);
        let mut buffers: Vec<usize> = before
            .iter()
            .map(|&(buffer, _)| buffer)
            .chain(self.checkpoints.keys().copied())
            .collect();
        buffers.sort_unstable();
        buffers.dedup();
        for buffer in buffers {
            let state = self.checkpointed(buffer);
            if state != was(buffer) {
                self.emit(UndoEvent::Checkpointed { buffer, state });
            }
        }
    }

    /// Drop all history, checkpoints and any open group.
    pub fn clear(&mut self) {
        let (could_undo, could_redo) = (self.can_undo(), self.can_redo());
        let saved = self.checkpoint_states();
        self.actions.clear();
        self.next_redo = 0;
        self.checkpoints.clear();
        self.group = None;
        if could_undo {
            self.emit(UndoEvent::CanUndo(false));
        }
        if could_redo {
            self.emit(UndoEvent::CanRedo(false));
        }
        self.emit_checkpoint_changes(&saved);
    }

    pub fn can_undo(&self) -> bool {
        self.next_redo > 0
    }

    pub fn can_redo(&self) -> bool {
        self.next_redo < self.actions.len()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Record an action that has already been applied. Any redo history
    /// is discarded. Inside a group the action goes to the group.
    pub fn add_action(&mut self, action: impl UndoAction<C> + 'static) {
        self.add_boxed(Box::new(action));
    }

    fn add_boxed(&mut self, action: Box<dyn UndoAction<C>>) {
        if let Some(group) = self.group.as_mut() {
            group.add_boxed(action);
            return;
        }

        let saved = self.checkpoint_states();
        let buffer = action.buffer();
        if self.checkpointed(buffer) {
            if let Some(checkpoint) = self.checkpoints.get_mut(&buffer) {
                checkpoint.1 = Some(self.next_redo);
            }
        } else if let Some(&(Some(start), _)) = self.checkpoints.get(&buffer) {
            // Editing after undoing past the saved state makes it unreachable.
            if start > self.next_redo {
                self.checkpoints.insert(buffer, (None, None));
            }
        }

        let (could_undo, could_redo) = (self.can_undo(), self.can_redo());
        self.actions.truncate(self.next_redo);
        self.actions.push(action);
        self.next_redo += 1;
        if !could_undo {
            self.emit(UndoEvent::CanUndo(true));
        }
        if could_redo {
            self.emit(UndoEvent::CanRedo(false));
        }
        self.emit_checkpoint_changes(&saved);
    }

    pub fn undo(&mut self, target: &mut C) -> Result<Vec<AppliedEdit>> {
        if !self.can_undo() {
            return Err(EngineError::NothingToUndo);
        }
        let saved = self.checkpoint_states();
        let could_redo = self.can_redo();
        self.next_redo -= 1;
        let edits = self.actions[self.next_redo].undo(target);
        if !self.can_undo() {
            self.emit(UndoEvent::CanUndo(false));
        }
        if !could_redo {
            self.emit(UndoEvent::CanRedo(true));
        }
        self.emit_checkpoint_changes(&saved);
        Ok(edits)
    }

    pub fn redo(&mut self, target: &mut C) -> Result<Vec<AppliedEdit>> {
        if !self.can_redo() {
            return Err(EngineError::NothingToRedo);
        }
        let saved = self.checkpoint_states();
        let could_undo = self.can_undo();
        let edits = self.actions[self.next_redo].redo(target);
        self.next_redo += 1;
        if !could_undo {
            self.emit(UndoEvent::CanUndo(true));
        }
        if !self.can_redo() {
            self.emit(UndoEvent::CanRedo(false));
        }
        self.emit_checkpoint_changes(&saved);
        Ok(edits)
    }

    /// Mark the current position as the saved state of `buffer`. Actions
    /// on other buffers either side of it stay within the saved window.
    pub fn checkpoint(&mut self, buffer: usize) {
        let saved = self.checkpoint_states();
        let mut start = self.next_redo;
        while start > 0 && self.actions[start - 1].buffer() != buffer {
            start -= 1;
        }
        let mut end = self.next_redo;
        while end + 1 < self.actions.len() && self.actions[end + 1].buffer() != buffer {
            end += 1;
        }
        let end = (end != self.actions.len()).then_some(end);
        self.checkpoints.insert(buffer, (Some(start), end));
        self.emit_checkpoint_changes(&saved);
    }

    /// Whether `buffer` is in its saved state.
    pub fn checkpointed(&self, buffer: usize) -> bool {
        match self.checkpoints.get(&buffer) {
            Some(&(Some(start), end)) => {
                let end = end.unwrap_or(self.actions.len());
                start <= self.next_redo && self.next_redo <= end
            }
            _ => false,
        }
    }

    /// Start collecting actions into a group that is undone as one.
    /// Groups nest.
    pub fn begin_group(&mut self) {
        match self.group.as_mut() {
            Some(group) => group.begin_group(),
            None => self.group = Some(Box::new(UndoSequence::new())),
        }
    }

    /// Close the innermost group. An empty group is dropped and a group
    /// of one action is recorded as that action.
    pub fn end_group(&mut self) {
        let Some(group) = self.group.as_mut() else {
            tracing::warn!("end_group called without an open group");
            return;
        };
        if group.group.is_some() {
            group.end_group();
            return;
        }
        let Some(mut group) = self.group.take() else {
            return;
        };
        match group.actions.len() {
            0 => {}
            1 => {
                if let Some(action) = group.actions.pop() {
                    self.add_boxed(action);
                }
            }
            _ => {
                let buffer = group.actions[0].buffer();
                self.add_boxed(Box::new(GroupAction { seq: *group, buffer }));
            }
        }
    }

    /// Discard the innermost open group without recording it. Its actions
    /// are not reverted.
    pub fn abort_group(&mut self) {
        if let Some(group) = self.group.as_mut() {
            if group.group.is_some() {
                group.abort_group();
            } else {
                self.group = None;
            }
        }
    }

    pub fn in_grouped_action(&self) -> bool {
        self.group.is_some()
    }

    pub fn begin_user_action(&mut self) {
        self.begin_group();
    }

    pub fn end_user_action(&mut self) {
        self.end_group();
    }
}

/// A closed group, undone and redone as a single step.
struct GroupAction<C: ?Sized> {
    seq: UndoSequence<C>,
    // A group spanning several buffers is attributed to the first one.
    buffer: usize,
}

impl<C: ?Sized + 'static> UndoAction<C> for GroupAction<C> {
    fn buffer(&self) -> usize {
        self.buffer
    }

    fn undo(&mut self, target: &mut C) -> Vec<AppliedEdit> {
        let mut edits = Vec::new();
        while let Ok(applied) = self.seq.undo(target) {
            edits.extend(applied);
        }
        edits
    }

    fn redo(&mut self, target: &mut C) -> Vec<AppliedEdit> {
        let mut edits = Vec::new();
        while let Ok(applied) = self.seq.redo(target) {
            edits.extend(applied);
        }
        edits
    }
}

/// Text inserted at a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertText {
    pub buffer: usize,
    pub offset: usize,
    pub text: String,
}

impl InsertText {
    pub fn new(buffer: usize, offset: usize, text: impl Into<String>) -> Self {
        Self {
            buffer,
            offset,
            text: text.into(),
        }
    }

    /// Perform the insertion.
    pub fn apply(&self, buffers: &mut [TextBuffer]) -> AppliedEdit {
        AppliedEdit {
            buffer: self.buffer,
            edit: buffers[self.buffer].insert(self.offset, &self.text),
        }
    }
}

impl UndoAction<[TextBuffer]> for InsertText {
    fn buffer(&self) -> usize {
        self.buffer
    }

    fn undo(&mut self, buffers: &mut [TextBuffer]) -> Vec<AppliedEdit> {
        let (_, edit) = buffers[self.buffer].delete(self.offset, self.offset + self.text.len());
        vec![AppliedEdit {
            buffer: self.buffer,
            edit,
        }]
    }

    fn redo(&mut self, buffers: &mut [TextBuffer]) -> Vec<AppliedEdit> {
        vec![self.apply(buffers)]
    }
}

/// Text removed from a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteText {
    pub buffer: usize,
    pub offset: usize,
    pub text: String,
}

impl DeleteText {
    /// Delete `[start, end)` from `buffers[buffer]`, returning the action
    /// that records it together with the edit.
    pub fn perform(buffers: &mut [TextBuffer], buffer: usize, start: usize, end: usize) -> (Self, AppliedEdit) {
        let (text, edit) = buffers[buffer].delete(start, end);
        let action = Self {
            buffer,
            offset: start,
            text,
        };
        (action, AppliedEdit { buffer, edit })
    }
}

impl UndoAction<[TextBuffer]> for DeleteText {
    fn buffer(&self) -> usize {
        self.buffer
    }

    fn undo(&mut self, buffers: &mut [TextBuffer]) -> Vec<AppliedEdit> {
        vec![AppliedEdit {
            buffer: self.buffer,
            edit: buffers[self.buffer].insert(self.offset, &self.text),
        }]
    }

    fn redo(&mut self, buffers: &mut [TextBuffer]) -> Vec<AppliedEdit> {
        let (_, edit) = buffers[self.buffer].delete(self.offset, self.offset + self.text.len());
        vec![AppliedEdit {
            buffer: self.buffer,
            edit,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type TextUndo = UndoSequence<[TextBuffer]>;

    fn recorded(seq: &mut TextUndo) -> Rc<RefCell<Vec<UndoEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        seq.connect(move |event| sink.borrow_mut().push(*event));
        events
    }

    fn insert(seq: &mut TextUndo, buffers: &mut [TextBuffer], buffer: usize, offset: usize, text: &str) {
        let action = InsertText::new(buffer, offset, text);
        action.apply(buffers);
        seq.add_action(action);
    }

    #[test]
    fn test_undo_redo_restores_text() {
        let mut buffers = vec![TextBuffer::new("one\ntwo\n")];
        let mut seq = TextUndo::new();
        insert(&mut seq, &mut buffers, 0, 4, "new\n");
        assert_eq!(buffers[0].text(), "one\nnew\ntwo\n");

        let edits = seq.undo(&mut buffers).unwrap();
        assert_eq!(buffers[0].text(), "one\ntwo\n");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].edit.start_line, 1);
        assert_eq!(edits[0].edit.line_delta, -1);

        let edits = seq.redo(&mut buffers).unwrap();
        assert_eq!(buffers[0].text(), "one\nnew\ntwo\n");
        assert_eq!(edits[0].edit.line_delta, 1);
    }

    #[test]
    fn test_nothing_to_undo_or_redo() {
        let mut buffers = vec![TextBuffer::new("")];
        let mut seq = TextUndo::new();
        assert!(matches!(seq.undo(&mut buffers), Err(EngineError::NothingToUndo)));
        assert!(matches!(seq.redo(&mut buffers), Err(EngineError::NothingToRedo)));
    }

    #[test]
    fn test_new_action_truncates_redo() {
        let mut buffers = vec![TextBuffer::new("")];
        let mut seq = TextUndo::new();
        insert(&mut seq, &mut buffers, 0, 0, "a");
        insert(&mut seq, &mut buffers, 0, 1, "b");
        seq.undo(&mut buffers).unwrap();
        assert!(seq.can_redo());
        insert(&mut seq, &mut buffers, 0, 1, "c");
        assert!(!seq.can_redo());
        assert_eq!(seq.len(), 2);
        assert_eq!(buffers[0].text(), "ac");
    }

    #[test]
    fn test_events_fire_on_transitions() {
        let mut buffers = vec![TextBuffer::new("")];
        let mut seq = TextUndo::new();
        let events = recorded(&mut seq);

        insert(&mut seq, &mut buffers, 0, 0, "a");
        insert(&mut seq, &mut buffers, 0, 1, "b");
        seq.undo(&mut buffers).unwrap();
        seq.undo(&mut buffers).unwrap();
        seq.redo(&mut buffers).unwrap();
        assert_eq!(
            *events.borrow(),
            vec![
                UndoEvent::CanUndo(true),
                UndoEvent::CanRedo(true),
                UndoEvent::CanUndo(false),
                UndoEvent::CanUndo(true),
            ]
        );
    }

    #[test]
    fn test_checkpoint_tracks_saved_state() {
        let mut buffers = vec![TextBuffer::new("x")];
        let mut seq = TextUndo::new();
        let events = recorded(&mut seq);

        seq.checkpoint(0);
        assert!(seq.checkpointed(0));
        insert(&mut seq, &mut buffers, 0, 1, "y");
        assert!(!seq.checkpointed(0));
        seq.undo(&mut buffers).unwrap();
        assert!(seq.checkpointed(0));

        assert_eq!(
            *events.borrow(),
            vec![
                UndoEvent::Checkpointed { buffer: 0, state: true },
                UndoEvent::CanUndo(true),
                UndoEvent::Checkpointed { buffer: 0, state: false },
                UndoEvent::CanUndo(false),
                UndoEvent::CanRedo(true),
                UndoEvent::Checkpointed { buffer: 0, state: true },
            ]
        );
    }

    #[test]
    fn test_checkpoint_events_only_on_change() {
        let mut buffers = vec![TextBuffer::new(""), TextBuffer::new("")];
        let mut seq = TextUndo::new();
        insert(&mut seq, &mut buffers, 0, 0, "a");
        let events = recorded(&mut seq);

        seq.checkpoint(0);
        seq.checkpoint(0);
        assert_eq!(*events.borrow(), vec![UndoEvent::Checkpointed { buffer: 0, state: true }]);

        // Stepping over another buffer's action keeps buffer 0 saved.
        events.borrow_mut().clear();
        insert(&mut seq, &mut buffers, 1, 0, "b");
        seq.undo(&mut buffers).unwrap();
        seq.redo(&mut buffers).unwrap();
        assert!(events
            .borrow()
            .iter()
            .all(|event| !matches!(event, UndoEvent::Checkpointed { .. })));

        // Undoing past the saved state is reported once, and so is the return.
        events.borrow_mut().clear();
        seq.undo(&mut buffers).unwrap();
        seq.undo(&mut buffers).unwrap();
        seq.redo(&mut buffers).unwrap();
        let checkpoint_events: Vec<UndoEvent> = events
            .borrow()
            .iter()
            .copied()
            .filter(|event| matches!(event, UndoEvent::Checkpointed { .. }))
            .collect();
        assert_eq!(
            checkpoint_events,
            vec![
                UndoEvent::Checkpointed { buffer: 0, state: false },
                UndoEvent::Checkpointed { buffer: 0, state: true },
            ]
        );
    }

    #[test]
    fn test_checkpoint_spans_other_buffers() {
        let mut buffers = vec![TextBuffer::new(""), TextBuffer::new("")];
        let mut seq = TextUndo::new();
        insert(&mut seq, &mut buffers, 0, 0, "a");
        seq.checkpoint(0);
        insert(&mut seq, &mut buffers, 1, 0, "b");
        assert!(seq.checkpointed(0), "edits to another buffer keep the saved state");
        seq.undo(&mut buffers).unwrap();
        assert!(seq.checkpointed(0));
        seq.undo(&mut buffers).unwrap();
        assert!(!seq.checkpointed(0));
    }

    #[test]
    fn test_checkpoint_lost_after_divergent_edit() {
        let mut buffers = vec![TextBuffer::new("")];
        let mut seq = TextUndo::new();
        insert(&mut seq, &mut buffers, 0, 0, "a");
        seq.checkpoint(0);
        seq.undo(&mut buffers).unwrap();
        insert(&mut seq, &mut buffers, 0, 0, "b");
        assert!(!seq.checkpointed(0));
        seq.undo(&mut buffers).unwrap();
        assert!(!seq.checkpointed(0));
    }

    #[test]
    fn test_group_undone_as_one() {
        let mut buffers = vec![TextBuffer::new("abc")];
        let mut seq = TextUndo::new();
        seq.begin_user_action();
        assert!(seq.in_grouped_action());
        let (action, _) = DeleteText::perform(&mut buffers, 0, 0, 1);
        seq.add_action(action);
        seq.begin_group();
        insert(&mut seq, &mut buffers, 0, 2, "Z");
        seq.end_group();
        assert!(seq.in_grouped_action());
        seq.end_user_action();
        assert!(!seq.in_grouped_action());

        assert_eq!(buffers[0].text(), "bcZ");
        assert_eq!(seq.len(), 1);
        let edits = seq.undo(&mut buffers).unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(buffers[0].text(), "abc");
        seq.redo(&mut buffers).unwrap();
        assert_eq!(buffers[0].text(), "bcZ");
    }

    #[test]
    fn test_empty_and_single_groups() {
        let mut buffers = vec![TextBuffer::new("")];
        let mut seq = TextUndo::new();
        seq.begin_group();
        seq.end_group();
        assert!(seq.is_empty());

        seq.begin_group();
        insert(&mut seq, &mut buffers, 0, 0, "a");
        seq.end_group();
        assert_eq!(seq.len(), 1);
        seq.undo(&mut buffers).unwrap();
        assert_eq!(buffers[0].text(), "");

        // Unbalanced end is ignored.
        seq.end_group();
    }

    #[test]
    fn test_abort_group_discards_recording() {
        let mut buffers = vec![TextBuffer::new("")];
        let mut seq = TextUndo::new();
        seq.begin_group();
        insert(&mut seq, &mut buffers, 0, 0, "a");
        seq.abort_group();
        assert!(!seq.in_grouped_action());
        assert!(seq.is_empty());
        assert_eq!(buffers[0].text(), "a");
    }

    #[test]
    fn test_clear() {
        let mut buffers = vec![TextBuffer::new("")];
        let mut seq = TextUndo::new();
        insert(&mut seq, &mut buffers, 0, 0, "a");
        insert(&mut seq, &mut buffers, 0, 1, "b");
        seq.undo(&mut buffers).unwrap();
        seq.checkpoint(0);
        let events = recorded(&mut seq);
        seq.clear();
        assert!(!seq.can_undo() && !seq.can_redo());
        assert_eq!(
            *events.borrow(),
            vec![
                UndoEvent::CanUndo(false),
                UndoEvent::CanRedo(false),
                UndoEvent::Checkpointed { buffer: 0, state: false },
            ]
        );
    }
}
