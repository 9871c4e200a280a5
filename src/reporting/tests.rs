#[cfg(test)]
mod tests {
    use crate::backoff::BackoffPolicy;
    use crate::channel::{InboundMessage, OutboundMessage, RecordingChannel};
    use crate::reporting::*;
    use crate::task::{AttachmentStatus, ContainerStatus, TaskStatus};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn container(task: &str, name: &str, status: ContainerStatus) -> StateChangeEvent {
        StateChangeEvent::Container(ContainerEvent {
            task_arn: task.to_string(),
            container_name: name.to_string(),
            runtime_id: Some(format!("{}-id", name)),
            status,
            exit_code: None,
            reason: None,
            network_bindings: Vec::new(),
            timestamp: Utc::now(),
        })
    }

    fn task(arn: &str, status: TaskStatus) -> StateChangeEvent {
        StateChangeEvent::Task(TaskEvent {
            task_arn: arn.to_string(),
            status,
            reason: None,
            timestamp: Utc::now(),
        })
    }

    fn attachment(arn: &str, id: &str) -> StateChangeEvent {
        StateChangeEvent::Attachment(AttachmentEvent {
            task_arn: arn.to_string(),
            attachment_id: id.to_string(),
            status: AttachmentStatus::Attached,
            timestamp: Utc::now(),
        })
    }

    fn config() -> ReportingConfig {
        ReportingConfig {
            ack_timeout_ms: 1_000,
            send_timeout_ms: 1_000,
            queue_size: 64,
            retry: BackoffPolicy {
                max_attempts: 3,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    #[test]
    fn test_pipeline_supersedes_pending_events() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(container("t1", "app", ContainerStatus::Pulled));
        pipeline.push(container("t1", "app", ContainerStatus::Created));
        pipeline.push(container("t1", "app", ContainerStatus::Running));

        let batches = pipeline.take_ready();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 1);
        assert!(matches!(
            &batches[0].events[0],
            StateChangeEvent::Container(e) if e.status == ContainerStatus::Running
        ));
        assert_eq!(pipeline.pending_len(), 0);
    }

    #[test]
    fn test_pipeline_batches_containers_with_task_event() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(container("t1", "app", ContainerStatus::Running));
        pipeline.push(container("t1", "sidecar", ContainerStatus::Running));
        pipeline.push(task("t1", TaskStatus::Running));
        pipeline.push(container("t1", "db", ContainerStatus::Running));
        pipeline.push(container("t2", "db", ContainerStatus::Running));

        let batches = pipeline.take_ready();
        assert_eq!(batches.len(), 2);

        let t1 = batches.iter().find(|b| b.task_arn == "t1").unwrap();
        match t1.to_message() {
            OutboundMessage::TaskStateChange(change) => {
                assert_eq!(change.status, Some(TaskStatus::Running));
                let names: Vec<_> =
                    change.containers.iter().map(|c| c.container_name.as_str()).collect();
                assert_eq!(names, vec!["app", "sidecar"]);
                assert_eq!(change.token, t1.token);
            }
            other => panic!("unexpected message {:?}", other),
        }

        // db was generated after the task event, so it waits for the next batch
        assert_eq!(pipeline.pending_len(), 1);
        assert!(pipeline.take_ready().is_empty());

        let token = t1.token.clone();
        assert!(pipeline.complete(&token).is_some());
        let next = pipeline.take_ready();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].task_arn, "t1");
        assert_ne!(next[0].token, token);
    }

    #[test]
    fn test_superseding_event_moves_behind_task_event() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(container("t1", "app", ContainerStatus::Running));
        pipeline.push(container("t1", "sidecar", ContainerStatus::Running));
        pipeline.push(task("t1", TaskStatus::Running));
        pipeline.push(container("t1", "app", ContainerStatus::Stopped));

        let first = pipeline.take_ready();
        let names: Vec<_> = first[0]
            .events
            .iter()
            .map(|e| match e {
                StateChangeEvent::Container(c) => c.container_name.clone(),
                StateChangeEvent::Task(_) => "task".to_string(),
                StateChangeEvent::Attachment(a) => a.attachment_id.clone(),
            })
            .collect();
        assert_eq!(names, vec!["sidecar", "task"]);

        pipeline.complete(&first[0].token);
        let second = pipeline.take_ready();
        assert!(matches!(
            second[0].events.as_slice(),
            [StateChangeEvent::Container(e)] if e.container_name == "app"
                && e.status == ContainerStatus::Stopped
        ));
    }

    #[test]
    fn test_requeue_keeps_token_when_nothing_changed() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(task("t1", TaskStatus::Running));
        let first = pipeline.take_ready().remove(0);
        pipeline.in_flight_mut(&first.token).unwrap().attempts = 1;

        assert_eq!(pipeline.requeue(&first.token).as_deref(), Some("t1"));
        assert!(pipeline.take_ready().is_empty(), "parked task must wait");

        pipeline.release("t1");
        let retry = pipeline.take_ready().remove(0);
        assert_eq!(retry.token, first.token);
        assert_eq!(retry.events, first.events);
        assert_eq!(retry.attempts, 1);
    }

    #[test]
    fn test_requeue_lets_newer_events_supersede() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(container("t1", "app", ContainerStatus::Running));
        pipeline.push(task("t1", TaskStatus::Running));
        let first = pipeline.take_ready().remove(0);
        pipeline.in_flight_mut(&first.token).unwrap().attempts = 2;

        pipeline.push(container("t1", "app", ContainerStatus::Stopped));
        pipeline.requeue(&first.token);
        pipeline.release("t1");

        // The stale app RUNNING is gone; the task event keeps its place in front
        let retry = pipeline.take_ready().remove(0);
        assert!(matches!(
            retry.events.as_slice(),
            [StateChangeEvent::Task(e)] if e.status == TaskStatus::Running
        ));
        assert_ne!(retry.token, first.token);
        assert_eq!(retry.attempts, 2);

        pipeline.complete(&retry.token);
        let next = pipeline.take_ready().remove(0);
        assert!(matches!(
            next.events.as_slice(),
            [StateChangeEvent::Container(e)] if e.status == ContainerStatus::Stopped
        ));
        assert_eq!(next.attempts, 0);
    }

    #[test]
    fn test_late_ack_for_requeued_batch_clears_its_events() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(task("t1", TaskStatus::Running));
        let first = pipeline.take_ready().remove(0);
        pipeline.requeue(&first.token);

        let acked = pipeline.complete(&first.token).unwrap();
        assert_eq!(acked.events, first.events);
        pipeline.release("t1");
        assert!(pipeline.take_ready().is_empty());
        assert!(pipeline.is_idle());
    }

    #[test]
    fn test_pipeline_does_not_touch_in_flight_events() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(container("t1", "app", ContainerStatus::Running));
        let first = pipeline.take_ready();

        pipeline.push(container("t1", "app", ContainerStatus::Stopped));
        assert_eq!(pipeline.in_flight_len(), 1);
        assert_eq!(pipeline.pending_len(), 1);

        let batch = pipeline.complete(&first[0].token).unwrap();
        assert_eq!(batch.events, first[0].events);
        assert_eq!(pipeline.take_ready().len(), 1);
    }

    #[test]
    fn test_attachment_events_travel_alone() {
        let mut pipeline = EventPipeline::new();
        pipeline.push(attachment("t1", "eni-1"));
        pipeline.push(container("t1", "app", ContainerStatus::Running));

        let batches = pipeline.take_ready();
        assert_eq!(batches.len(), 1);
        assert!(matches!(
            batches[0].to_message(),
            OutboundMessage::AttachmentStateChange(ref change) if change.attachment_id == "eni-1"
        ));

        pipeline.abandon(&batches[0].token);
        let batches = pipeline.take_ready();
        assert!(matches!(
            batches[0].to_message(),
            OutboundMessage::TaskStateChange(_)
        ));
        assert!(pipeline.take_ready().is_empty());
        pipeline.complete(&batches[0].token);
        assert!(pipeline.is_idle());
    }

    fn start_sender(
        channel: Arc<RecordingChannel>,
        config: ReportingConfig,
    ) -> (StatusSenderHandle, mpsc::UnboundedReceiver<DeliveryNotice>) {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (sender, handle) = StatusSender::new(channel.clone(), config, notices_tx);
        sender.spawn();

        let (acks_tx, mut acks_rx) = mpsc::channel(64);
        channel.ack_into(acks_tx);
        let ack_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(message) = acks_rx.recv().await {
                if let InboundMessage::Ack { token } = message {
                    ack_handle.ack(&token);
                }
            }
        });

        (handle, notices_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_delivers_and_reports() {
        let channel = Arc::new(RecordingChannel::new());
        let (handle, mut notices) = start_sender(channel.clone(), config());

        handle.publish(container("t1", "app", ContainerStatus::Running)).await;
        handle.publish(task("t1", TaskStatus::Running)).await;

        let mut containers_seen = Vec::new();
        loop {
            match notices.recv().await {
                Some(DeliveryNotice::Delivered {
                    task_status,
                    containers,
                    ..
                }) => {
                    containers_seen.extend(containers);
                    if task_status == Some(TaskStatus::Running) {
                        break;
                    }
                }
                other => panic!("unexpected notice {:?}", other),
            }
        }

        assert_eq!(
            containers_seen,
            vec![("app".to_string(), ContainerStatus::Running)]
        );
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_retransmits_with_same_token_when_ack_is_lost() {
        let channel = Arc::new(RecordingChannel::new());
        channel.set_drop_acks(true);
        let (handle, mut notices) = start_sender(channel.clone(), config());

        handle.publish(task("t1", TaskStatus::Running)).await;
        channel.wait_for_messages(1).await;

        channel.set_drop_acks(false);
        channel.wait_for_messages(2).await;

        let messages = channel.messages();
        assert_eq!(messages[0].token(), messages[1].token());
        assert!(matches!(
            notices.recv().await,
            Some(DeliveryNotice::Delivered { .. })
        ));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_retries_failed_sends() {
        let channel = Arc::new(RecordingChannel::new());
        channel.fail_sends(2);
        let (handle, mut notices) = start_sender(channel.clone(), config());

        handle.publish(task("t1", TaskStatus::Stopped)).await;

        match notices.recv().await {
            Some(DeliveryNotice::Delivered { task_status, .. }) => {
                assert_eq!(task_status, Some(TaskStatus::Stopped))
            }
            other => panic!("unexpected notice {:?}", other),
        }
        assert_eq!(channel.messages().len(), 1);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_carries_newer_status_after_lost_ack() {
        let channel = Arc::new(RecordingChannel::new());
        channel.set_drop_acks(true);
        let (handle, mut notices) = start_sender(channel.clone(), config());

        handle.publish(container("t1", "app", ContainerStatus::Running)).await;
        channel.wait_for_messages(1).await;
        handle.publish(container("t1", "app", ContainerStatus::Stopped)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.set_drop_acks(false);

        match notices.recv().await {
            Some(DeliveryNotice::Delivered { containers, .. }) => {
                assert_eq!(containers, vec![("app".to_string(), ContainerStatus::Stopped)])
            }
            other => panic!("unexpected notice {:?}", other),
        }

        let statuses: Vec<_> = channel
            .task_changes()
            .iter()
            .flat_map(|change| change.containers.iter().map(|c| c.status))
            .collect();
        assert_eq!(statuses, vec![ContainerStatus::Running, ContainerStatus::Stopped]);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_abandons_after_budget() {
        let channel = Arc::new(RecordingChannel::new());
        channel.set_drop_acks(true);
        let (handle, mut notices) = start_sender(channel.clone(), config());

        handle.publish(task("t1", TaskStatus::Running)).await;

        match notices.recv().await {
            Some(DeliveryNotice::Abandoned { task_arn, .. }) => assert_eq!(task_arn, "t1"),
            other => panic!("unexpected notice {:?}", other),
        }
        assert_eq!(channel.messages().len(), 3);

        // the task's queue is free again
        channel.set_drop_acks(false);
        handle.publish(task("t1", TaskStatus::Stopped)).await;
        assert!(matches!(
            notices.recv().await,
            Some(DeliveryNotice::Delivered { .. })
        ));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ack_is_ignored() {
        let channel = Arc::new(RecordingChannel::new());
        let (handle, mut notices) = start_sender(channel.clone(), config());

        handle.publish(task("t1", TaskStatus::Running)).await;
        assert!(notices.recv().await.is_some());

        let token = channel.messages()[0].token().to_string();
        handle.ack(&token);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(notices.try_recv().is_err());
        handle.shutdown();
    }
}
