#[cfg(test)]
mod tests {
    use crate::runtime::*;
    use crate::task::*;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn task() -> Task {
        let spec = TaskSpec::new("arn:task/cluster/t1", "web")
            .with_resource(ResourceSpec::volume("data"))
            .with_container(
                ContainerSpec::new("app", "nginx")
                    .with_mount("data", "/data")
                    .with_volumes_from("seed")
                    .with_env("MODE", "prod")
                    .with_port(80, Some(8080)),
            )
            .with_container(ContainerSpec::new("seed", "busybox"));
        Task::from_spec(spec, 1)
    }

    fn request(name: &str) -> CreateContainerRequest {
        let task = task();
        let mut request = CreateContainerRequest::for_container(&task, task.container("app").unwrap());
        request.container_name = name.to_string();
        request
    }

    #[test]
    fn test_create_request_from_task() {
        let mut task = task();
        task.container_mut("seed").unwrap().runtime_id = Some("seed-id".to_string());

        let request = CreateContainerRequest::for_container(&task, task.container("app").unwrap());
        assert_eq!(request.name, "node-agent-web-1-app-t1");
        assert_eq!(request.binds.len(), 1);
        assert_eq!(request.binds[0].volume, "node-agent-t1-data");
        assert_eq!(request.binds[0].container_path, "/data");
        assert_eq!(request.volumes_from, vec!["seed-id".to_string()]);
        assert_eq!(request.env.get("MODE").map(String::as_str), Some("prod"));
        assert_eq!(
            request.labels.get("node-agent.task-arn").map(String::as_str),
            Some("arn:task/cluster/t1")
        );
        assert_eq!(
            request.labels.get("node-agent.container-name").map(String::as_str),
            Some("app")
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(RuntimeError::Timeout(Duration::from_secs(1)).retryable());
        assert!(RuntimeError::Api("busy".into()).retryable());
        assert!(!RuntimeError::NotFound("x".into()).retryable());
        assert!(!RuntimeError::InvalidConfig("x".into()).retryable());
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let runtime = MockRuntime::new();
        runtime.pull_image("nginx").await.unwrap();

        let created = runtime.create_container(&request("app")).await.unwrap();
        assert_eq!(created.status, ContainerStatus::Created);

        let started = runtime.start_container(&created.runtime_id).await.unwrap();
        assert_eq!(started.status, ContainerStatus::Running);
        assert!(started.started_at.is_some());

        runtime.set_stop_exit_code("app", 143);
        let stopped = runtime
            .stop_container(&created.runtime_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stopped.status, ContainerStatus::Stopped);
        assert_eq!(stopped.exit_code, Some(143));

        runtime.remove_container(&created.runtime_id).await.unwrap();
        assert!(matches!(
            runtime.inspect_container(&created.runtime_id).await,
            Err(RuntimeError::NotFound(_))
        ));

        assert_eq!(runtime.count(Operation::Start, "app"), 1);
        assert_eq!(runtime.count(Operation::Pull, "nginx"), 1);
    }

    #[tokio::test]
    async fn test_mock_injected_failures() {
        let runtime = MockRuntime::new();
        runtime.fail_next(Operation::Pull, "nginx", 2);

        assert!(matches!(
            runtime.pull_image("nginx").await,
            Err(RuntimeError::PullFailed { .. })
        ));
        assert!(runtime.pull_image("nginx").await.is_err());
        assert!(runtime.pull_image("nginx").await.is_ok());
        assert_eq!(runtime.count(Operation::Pull, "nginx"), 3);
    }

    #[tokio::test]
    async fn test_mock_events() {
        let runtime = MockRuntime::new();
        let mut events = runtime.events();

        let created = runtime.create_container(&request("app")).await.unwrap();
        runtime.start_container(&created.runtime_id).await.unwrap();
        runtime.set_health("app", HealthStatus::Healthy);
        runtime.exit("app", 1);

        let started = events.next().await.unwrap();
        assert_eq!(started.kind, RuntimeEventKind::Started);
        assert_eq!(started.runtime_id, created.runtime_id);
        assert_eq!(
            events.next().await.unwrap().kind,
            RuntimeEventKind::Health(HealthStatus::Healthy)
        );
        assert_eq!(
            events.next().await.unwrap().kind,
            RuntimeEventKind::Died { exit_code: Some(1) }
        );
        assert_eq!(runtime.status("app"), Some(ContainerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_provisioner_volumes() {
        let runtime = Arc::new(MockRuntime::new());
        let provisioner = RuntimeProvisioner::new(runtime.clone());

        let volume = ResourceSpec::volume("data");
        provisioner.provision("arn:task/t1", &volume).await.unwrap();
        assert_eq!(runtime.volumes(), vec!["node-agent-t1-data".to_string()]);

        provisioner.release("arn:task/t1", &volume).await.unwrap();
        assert!(runtime.volumes().is_empty());

        // already gone
        provisioner.release("arn:task/t1", &volume).await.unwrap();
    }

    #[tokio::test]
    async fn test_provisioner_accepts_secrets_and_credentials() {
        let runtime = Arc::new(MockRuntime::new());
        let provisioner = RuntimeProvisioner::new(runtime.clone());

        provisioner
            .provision("arn:task/t1", &ResourceSpec::secret("token", "vault:/token"))
            .await
            .unwrap();
        provisioner
            .provision("arn:task/t1", &ResourceSpec::credentials("role", "c-1"))
            .await
            .unwrap();
        assert!(runtime.calls().is_empty());
    }
}
