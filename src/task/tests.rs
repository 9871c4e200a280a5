#[cfg(test)]
mod tests {
    use crate::dependency::required_resources;
    use crate::task::*;

    fn web_task() -> TaskSpec {
        TaskSpec::new("arn:aws:ecs:us-east-1:123:task/default/abc123", "web")
            .with_container(ContainerSpec::new("app", "nginx:latest").with_mount("data", "/data"))
            .with_container(
                ContainerSpec::new("sidecar", "busybox")
                    .non_essential()
                    .with_secret("db-password"),
            )
            .with_resource(ResourceSpec::volume("data"))
            .with_resource(ResourceSpec::secret("db-password", "ssm:/db/password"))
            .with_resource(ResourceSpec::credentials("role", "creds-1"))
    }

    #[test]
    fn test_status_total_order() {
        use ContainerStatus::*;
        let ordered = [None, Pulled, Created, Running, Stopped, Removed];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} should precede {}", pair[0], pair[1]);
        }
        assert!(Stopped.is_stopped());
        assert!(Removed.is_stopped());
        assert!(!Running.is_stopped());
        assert!(!Removed.is_reportable());
        assert_eq!(Removed.task_status(), TaskStatus::Stopped);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ContainerStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let status: TaskStatus = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(status, TaskStatus::Stopped);
    }

    #[test]
    fn test_forward_transitions() {
        use ContainerStatus::*;
        assert_eq!(next_step(None, Running), Step::Apply(RuntimeAction::Pull));
        assert_eq!(next_step(Pulled, Running), Step::Apply(RuntimeAction::Create));
        assert_eq!(next_step(Created, Running), Step::Apply(RuntimeAction::Start));
        assert_eq!(next_step(Running, Running), Step::Satisfied);
        assert_eq!(next_step(Pulled, Created), Step::Apply(RuntimeAction::Create));
        assert_eq!(next_step(Created, Created), Step::Satisfied);
    }

    #[test]
    fn test_stop_transitions() {
        use ContainerStatus::*;
        assert_eq!(next_step(Running, Stopped), Step::Apply(RuntimeAction::Stop));
        assert_eq!(next_step(Created, Stopped), Step::Apply(RuntimeAction::Stop));
        assert_eq!(next_step(Pulled, Stopped), Step::MarkStopped);
        assert_eq!(next_step(None, Stopped), Step::MarkStopped);
        assert_eq!(next_step(Stopped, Stopped), Step::Satisfied);
        assert_eq!(next_step(Stopped, Running), Step::Satisfied);
    }

    #[test]
    fn test_remove_transitions() {
        use ContainerStatus::*;
        assert_eq!(next_step(Stopped, Removed), Step::Apply(RuntimeAction::Remove));
        assert_eq!(next_step(Running, Removed), Step::Apply(RuntimeAction::Stop));
        assert_eq!(next_step(None, Removed), Step::MarkStopped);
        assert_eq!(next_step(Removed, Removed), Step::Satisfied);
    }

    #[test]
    fn test_action_targets() {
        assert_eq!(RuntimeAction::Pull.target(), ContainerStatus::Pulled);
        assert_eq!(RuntimeAction::Remove.target(), ContainerStatus::Removed);
        assert_eq!(RuntimeAction::Stop.target(), ContainerStatus::Stopped);
    }

    #[test]
    fn test_resource_transitions() {
        use ResourceStatus::*;
        assert_eq!(next_resource_action(None, Created), Some(ResourceAction::Provision));
        assert_eq!(next_resource_action(Created, Created), Option::None);
        assert_eq!(next_resource_action(Created, Removed), Some(ResourceAction::Release));
        assert_eq!(next_resource_action(None, Removed), Some(ResourceAction::MarkRemoved));
        assert_eq!(next_resource_action(Removed, Removed), Option::None);
        assert_eq!(next_resource_action(Removed, Created), Option::None);
    }

    #[test]
    fn test_task_from_spec() {
        let task = Task::from_spec(web_task(), 7);

        assert_eq!(task.seq_num, 7);
        assert_eq!(task.containers.len(), 2);
        assert_eq!(task.known_status, TaskStatus::None);
        assert!(task
            .containers
            .iter()
            .all(|c| c.desired_status == ContainerStatus::Running));
        assert!(task
            .resources
            .iter()
            .all(|r| r.desired_status == ResourceStatus::Created));
        assert!(task.container("app").unwrap().is_essential());
        assert!(!task.container("sidecar").unwrap().is_essential());
    }

    #[test]
    fn test_task_from_stopped_spec() {
        let task = Task::from_spec(web_task().with_desired_status(TaskStatus::Stopped), 1);
        assert!(task
            .containers
            .iter()
            .all(|c| c.desired_status == ContainerStatus::Stopped));
        assert!(task
            .resources
            .iter()
            .all(|r| r.desired_status == ResourceStatus::Removed));
    }

    #[test]
    fn test_computed_known_status_is_minimum() {
        let mut task = Task::from_spec(web_task(), 1);
        task.containers[0].known_status = ContainerStatus::Running;
        task.containers[1].known_status = ContainerStatus::Created;
        assert_eq!(task.computed_known_status(), TaskStatus::Created);

        task.containers[1].known_status = ContainerStatus::Running;
        assert_eq!(task.computed_known_status(), TaskStatus::Running);

        task.containers[0].known_status = ContainerStatus::Removed;
        task.containers[1].known_status = ContainerStatus::Stopped;
        assert_eq!(task.computed_known_status(), TaskStatus::Stopped);
    }

    #[test]
    fn test_steady_container() {
        let mut task = Task::from_spec(web_task(), 1);
        let app = &mut task.containers[0];
        assert!(!app.is_steady());

        app.known_status = ContainerStatus::Running;
        assert!(app.is_steady());

        app.desired_status = ContainerStatus::Stopped;
        assert!(!app.is_steady());
    }

    #[test]
    fn test_required_resources() {
        let task = Task::from_spec(web_task(), 1);

        let app = task.container("app").unwrap();
        let names: Vec<_> = required_resources(app, &task.resources)
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["data", "role"]);

        let sidecar = task.container("sidecar").unwrap();
        let names: Vec<_> = required_resources(sidecar, &task.resources)
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["db-password", "role"]);
    }

    #[test]
    fn test_runtime_names() {
        let task = Task::from_spec(web_task(), 1);
        let app = task.container("app").unwrap();
        assert_eq!(app.runtime_name(&task), "node-agent-web-1-app-abc123");
        assert_eq!(
            task.resources[0].spec.runtime_name(&task.arn),
            "node-agent-abc123-data"
        );
        assert_eq!(sanitize_runtime_name("a/b:c d"), "a-b-c-d");
        assert_eq!(short_task_id("no-slashes"), "no-slashes");
    }

    #[test]
    fn test_container_dependency_lookup() {
        let spec = ContainerSpec::new("app", "nginx")
            .depends_on("db", DependencyCondition::Healthy)
            .with_volumes_from("config");
        let container = Container::new(spec, ContainerStatus::Running);
        assert!(container.depends_on("db"));
        assert!(container.depends_on("config"));
        assert!(!container.depends_on("app"));
    }

    #[test]
    fn test_task_spec_from_json() {
        let json = r#"{
            "arn": "arn:task/1",
            "family": "batch",
            "desired_status": "RUNNING",
            "containers": [
                {"name": "init", "image": "busybox", "essential": false},
                {"name": "main", "image": "app:1",
                 "depends_on": [{"container_name": "init", "condition": "SUCCESS"}],
                 "mounts": [{"source_volume": "scratch", "container_path": "/scratch"}]}
            ],
            "resources": [
                {"name": "scratch", "type": "volume"},
                {"name": "token", "type": "secret", "source": "vault:/token"}
            ]
        }"#;

        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert!(!spec.containers[0].essential);
        assert!(spec.containers[1].essential);
        assert_eq!(
            spec.containers[1].depends_on[0].condition,
            DependencyCondition::Success
        );
        assert!(matches!(
            &spec.resources[0].kind,
            ResourceKind::Volume { driver, .. } if driver == "local"
        ));
        assert_eq!(spec.resources[1].kind_name(), "secret");
    }
}
