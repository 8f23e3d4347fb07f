use serde_json::json;

use crate::models::TaskStatus;
use crate::services::task_queue::TaskQueue;

#[tokio::test]
async fn enqueued_tasks_start_pending_and_stay_queryable() {
    let queue = TaskQueue::new();
    let task = queue.enqueue("process_file", json!({ "path": "/a.txt" }));

    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.error.is_none());

    let fetched = queue.get_task(task.id).unwrap();
    assert_eq!(fetched.id, task.id);
    assert_eq!(fetched.name, "process_file");
    assert_eq!(fetched.task_info["path"], "/a.txt");
}

#[tokio::test]
async fn unknown_task_ids_are_absent() {
    let queue = TaskQueue::new();
    assert!(queue.get_task(uuid::Uuid::new_v4()).is_none());
}

#[tokio::test]
async fn all_tasks_reports_every_enqueued_task() {
    let queue = TaskQueue::new();
    let a = queue.enqueue("process_file", json!({}));
    let b = queue.enqueue("automation_task", json!({}));

    let all = queue.all_tasks();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|t| t.id == a.id));
    assert!(all.iter().any(|t| t.id == b.id));
}

#[tokio::test]
async fn stop_without_start_is_a_noop() {
    let queue = TaskQueue::new();
    queue.stop_worker().await;
}
