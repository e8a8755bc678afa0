//! Translation between `ConcreteTaskInstance` and the persisted document.

use crate::domain::{
    ConcreteTaskInstance, DocumentMetadata, Result, TASK_DOCUMENT_TYPE, TaskDocument, TaskFields,
};
use crate::ports::StoredDocument;

pub(crate) fn to_document(
    instance: &ConcreteTaskInstance,
    metadata: DocumentMetadata,
) -> Result<TaskDocument> {
    Ok(TaskDocument {
        id: instance.id.clone(),
        doc_type: TASK_DOCUMENT_TYPE.to_string(),
        task: TaskFields {
            task_type: instance.task_type.clone(),
            scheduled_at: instance.scheduled_at,
            run_at: instance.run_at,
            interval: instance.interval,
            attempts: instance.attempts,
            status: instance.status,
            params: serde_json::to_string(&instance.params)?,
            state: serde_json::to_string(&instance.state)?,
            user: instance.user.clone(),
            scope: instance.scope.clone(),
        },
        metadata,
    })
}

pub(crate) fn from_stored(stored: StoredDocument) -> Result<ConcreteTaskInstance> {
    let StoredDocument {
        document, token, ..
    } = stored;
    let task = document.task;
    Ok(ConcreteTaskInstance {
        id: document.id,
        token,
        task_type: task.task_type,
        params: serde_json::from_str(&task.params)?,
        state: serde_json::from_str(&task.state)?,
        scheduled_at: task.scheduled_at,
        run_at: task.run_at,
        interval: task.interval,
        attempts: task.attempts,
        status: task.status,
        user: task.user,
        scope: task.scope,
    })
}
