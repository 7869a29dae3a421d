//! Reducer actions, in the `{ "type": ..., "value": ... }` shape carried by
//! `send-message` payloads.

use serde::{Deserialize, Serialize};

use crate::task::{PartialTask, TaskId, TaskNode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "UPPERCASE")]
pub enum Action {
    /// Insert a task (optionally carrying a subtree).
    Add(TaskNode),
    /// Delete a task and its entire subtree.
    Remove(TaskId),
    /// Flip completion and cascade.
    Check(TaskId),
    /// Merge truthy fields into an existing task.
    Update(PartialTask),
}

impl Action {
    /// The id this action targets.
    pub fn target(&self) -> &str {
        match self {
            Action::Add(node) => &node.task.id,
            Action::Remove(id) | Action::Check(id) => id,
            Action::Update(patch) => &patch.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Add(_) => "ADD",
            Action::Remove(_) => "REMOVE",
            Action::Check(_) => "CHECK",
            Action::Update(_) => "UPDATE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn test_check_action_wire_shape() {
        let action: Action = serde_json::from_str(r#"{"type":"CHECK","value":"5"}"#).unwrap();
        assert_eq!(action, Action::Check("5".into()));
        assert_eq!(
            serde_json::to_string(&action).unwrap(),
            r#"{"type":"CHECK","value":"5"}"#
        );
    }

    #[test]
    fn test_add_action_accepts_nested_children() {
        let action: Action = serde_json::from_str(
            r#"{"type":"ADD","value":{"id":"9","title":"T","isDone":false,"order":0,
                "children":[{"id":"10","parentId":"9","title":"C","isDone":true,"order":0}]}}"#,
        )
        .unwrap();
        match action {
            Action::Add(node) => {
                assert_eq!(node.task.id, "9");
                assert_eq!(node.children.len(), 1);
                assert!(node.children[0].task.is_done);
            }
            other => panic!("expected ADD, got {other:?}"),
        }
    }

    #[test]
    fn test_update_action_keeps_partial_fields() {
        let action: Action =
            serde_json::from_str(r#"{"type":"UPDATE","value":{"id":"3","title":"new"}}"#).unwrap();
        assert_eq!(action.target(), "3");
        assert_eq!(action.kind(), "UPDATE");
    }

    #[test]
    fn test_unknown_action_type_is_rejected() {
        assert!(serde_json::from_str::<Action>(r#"{"type":"MOVE","value":"1"}"#).is_err());
    }

    #[test]
    fn test_add_target_is_task_id() {
        let action = Action::Add(Task::new("7", "x").into());
        assert_eq!(action.target(), "7");
    }
}
