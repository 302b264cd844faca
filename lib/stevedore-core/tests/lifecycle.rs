use std::{sync::Arc, time::Duration};

use similar_asserts::assert_eq;
use stevedore_core::{
    options::{ImageRemoval, OptionError, OptionName, OptionSet},
    orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError},
    resolver::PlanError,
    runtime::{ExecRequest, InMemoryRuntime, InstanceState, RuntimeCall, RuntimeOperation},
    topology::{InstanceId, RecreatePolicy, ServiceDefinition, ServiceId, Topology},
};

fn id(raw: &str) -> ServiceId {
    ServiceId::try_from(raw).unwrap()
}

fn ids(raw: &[&str]) -> Vec<ServiceId> {
    raw.iter().map(|s| id(s)).collect()
}

fn instance(service: &str, index: usize) -> InstanceId {
    InstanceId::new(id(service), index)
}

fn create(service: &str, created: &[usize]) -> RuntimeCall {
    RuntimeCall::Create {
        service: id(service),
        created: created.to_vec(),
    }
}

fn start(service: &str, index: usize) -> RuntimeCall {
    RuntimeCall::Start(instance(service, index))
}

fn stop(service: &str, index: usize) -> RuntimeCall {
    RuntimeCall::Stop(instance(service, index))
}

fn remove(service: &str, index: usize, volumes: bool) -> RuntimeCall {
    RuntimeCall::Remove {
        instance: instance(service, index),
        volumes,
    }
}

fn web_stack() -> Arc<Topology> {
    Arc::new(
        Topology::load([
            ServiceDefinition::new("db").with_image("postgres:16"),
            ServiceDefinition::new("cache").with_image("redis:7"),
            ServiceDefinition::new("api")
                .with_image("example/api:1.0")
                .with_dependencies(["db", "cache"]),
        ])
        .unwrap(),
    )
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_call_timeout(Duration::from_secs(5))
        .with_settle_interval(Duration::from_millis(1))
        .with_exit_poll_interval(Duration::from_millis(5))
}

fn orchestrator(topology: Arc<Topology>, runtime: &Arc<InMemoryRuntime>) -> Orchestrator {
    Orchestrator::new(topology, runtime.clone(), fast_config())
}

fn overrides(pairs: &[(&str, &str)]) -> OptionSet {
    pairs
        .iter()
        .fold(OptionSet::default(), |options, (name, value)| {
            options.with_override(*name, *value).unwrap()
        })
}

#[tokio::test]
async fn start_service_brings_dependencies_up_first() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);

    let plan = orchestrator.plan_start(Some("api"), &OptionSet::default()).unwrap();
    assert_eq!(plan.entries(), ids(&["db", "cache", "api"]).as_slice());

    let progress = orchestrator
        .start_service("api", 3, &OptionSet::default())
        .await
        .unwrap();
    assert_eq!(progress.completed, ids(&["db", "cache", "api"]));
    assert!(progress.is_complete());

    assert_eq!(
        runtime.mutations(),
        vec![
            create("db", &[1]),
            start("db", 1),
            create("cache", &[1]),
            start("cache", 1),
            create("api", &[1, 2, 3]),
            start("api", 1),
            start("api", 2),
            start("api", 3),
        ]
    );

    // Only the requested service is scaled; the override is recorded on its instances.
    let applied = runtime.applied_options(&instance("api", 3)).unwrap();
    assert_eq!(applied.scale_for(&id("api")), Some(3));
    assert_eq!(runtime.state_of(&instance("db", 2)), InstanceState::Absent);
}

#[tokio::test]
async fn start_service_ignores_dependency_scale_overrides() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);

    let options = overrides(&[("scale", "db=2")]);
    orchestrator.start_service("api", 3, &options).await.unwrap();

    assert_eq!(runtime.state_of(&instance("db", 1)), InstanceState::Running);
    assert_eq!(runtime.state_of(&instance("db", 2)), InstanceState::Absent);
    assert_eq!(runtime.state_of(&instance("api", 3)), InstanceState::Running);
}

#[tokio::test]
async fn starting_twice_is_a_no_op() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);

    orchestrator.start_all(&OptionSet::default()).await.unwrap();
    runtime.clear_journal();

    let progress = orchestrator.start_all(&OptionSet::default()).await.unwrap();
    assert_eq!(progress.completed, ids(&["db", "cache", "api"]));
    assert_eq!(runtime.mutations(), Vec::new());
}

#[tokio::test]
async fn stop_service_stops_dependents_first() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);
    orchestrator.start_all(&OptionSet::default()).await.unwrap();
    runtime.clear_journal();

    let plan = orchestrator.plan_stop(Some("db"), &OptionSet::default()).unwrap();
    assert_eq!(plan.entries(), ids(&["api", "db"]).as_slice());

    let progress = orchestrator.stop_service("db", &OptionSet::default()).await.unwrap();
    assert_eq!(progress.completed, ids(&["api", "db"]));
    assert_eq!(
        runtime.mutations(),
        vec![stop("api", 1), remove("api", 1, false), stop("db", 1), remove("db", 1, false)]
    );
    assert_eq!(runtime.state_of(&instance("cache", 1)), InstanceState::Running);
}

#[tokio::test]
async fn stop_all_mirrors_start_all() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);
    orchestrator.start_all(&OptionSet::default()).await.unwrap();

    let progress = orchestrator.stop_all(&OptionSet::default()).await.unwrap();
    assert_eq!(progress.completed, ids(&["api", "cache", "db"]));
    for service in ["db", "cache", "api"] {
        assert_eq!(runtime.state_of(&instance(service, 1)), InstanceState::Absent);
    }
}

#[tokio::test]
async fn no_deps_only_touches_the_named_service() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);

    let options = overrides(&[("no-deps", "true")]);
    let progress = orchestrator.start_service("api", 1, &options).await.unwrap();
    assert_eq!(progress.completed, ids(&["api"]));

    let journal = runtime.journal();
    assert!(journal.iter().all(|call| match call {
        RuntimeCall::Create { service, .. } => service == "api",
        RuntimeCall::Start(instance) | RuntimeCall::Inspect(instance) => instance.service() == "api",
        RuntimeCall::Instances => true,
        other => panic!("unexpected call: {:?}", other),
    }));
    assert_eq!(runtime.mutations(), vec![create("api", &[1]), start("api", 1)]);
}

#[tokio::test]
async fn invalid_options_are_rejected_before_any_runtime_call() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);

    let result = OptionSet::default().with_override("bogus", 1);
    assert_eq!(
        result,
        Err(OptionError::UnknownOption {
            name: "bogus".to_string()
        })
    );

    let result = OptionSet::default().with_override("scale", "api=-1");
    assert!(matches!(
        result,
        Err(OptionError::InvalidValue {
            option: OptionName::Scale,
            ..
        })
    ));

    let result = orchestrator.start_service("api", 0, &OptionSet::default()).await;
    assert!(matches!(result, Err(OrchestratorError::Options { .. })));

    let result = orchestrator.start_service("worker", 1, &OptionSet::default()).await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Plan {
            source: PlanError::UnknownService { .. }
        })
    ));

    assert_eq!(runtime.journal(), Vec::new());
}

#[tokio::test]
async fn failure_aborts_the_rest_of_the_plan() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.inject_failure(RuntimeOperation::Create, "cache");
    let orchestrator = orchestrator(web_stack(), &runtime);

    let error = orchestrator
        .start_service("api", 1, &OptionSet::default())
        .await
        .unwrap_err();

    match &error {
        OrchestratorError::RuntimeCall { source, progress } => {
            assert!(!source.is_timeout());
            assert_eq!(source.operation(), RuntimeOperation::Create);
            assert_eq!(progress.completed, ids(&["db"]));
            assert_eq!(progress.failed, ids(&["cache"]));
            assert_eq!(progress.not_attempted, ids(&["api"]));
        }
        other => panic!("expected runtime call error, got {:?}", other),
    }

    // No rollback: the dependency that did start stays up.
    assert_eq!(runtime.state_of(&instance("db", 1)), InstanceState::Running);
    assert_eq!(runtime.state_of(&instance("api", 1)), InstanceState::Absent);
}

#[tokio::test]
async fn slow_calls_time_out() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.inject_delay(RuntimeOperation::Start, Duration::from_millis(500));
    let orchestrator = Orchestrator::new(
        web_stack(),
        runtime.clone(),
        fast_config().with_call_timeout(Duration::from_millis(20)),
    );

    let error = orchestrator
        .start_service("db", 1, &OptionSet::default())
        .await
        .unwrap_err();

    match error {
        OrchestratorError::RuntimeCall { source, progress } => {
            assert!(source.is_timeout());
            assert_eq!(source.operation(), RuntimeOperation::Start);
            assert_eq!(progress.failed, ids(&["db"]));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn exited_dependency_blocks_dependents() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.exit_on_start("db");
    let orchestrator = orchestrator(web_stack(), &runtime);

    let error = orchestrator
        .start_service("api", 1, &OptionSet::default())
        .await
        .unwrap_err();

    match error {
        OrchestratorError::DependencyUnavailable {
            service,
            dependency,
            state,
            progress,
            ..
        } => {
            assert_eq!(service, "api");
            assert_eq!(dependency, "db");
            assert_eq!(state, InstanceState::Stopped);
            assert_eq!(progress.completed, ids(&["db", "cache"]));
            assert_eq!(progress.failed, ids(&["api"]));
        }
        other => panic!("expected unavailable dependency, got {:?}", other),
    }
    assert_eq!(runtime.state_of(&instance("api", 1)), InstanceState::Absent);
}

#[tokio::test]
async fn abort_on_container_exit_stops_the_batch() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.exit_on_start("api");
    let orchestrator = orchestrator(web_stack(), &runtime);

    let options = overrides(&[("abort-on-container-exit", "true")]);
    let error = orchestrator.start_all(&options).await.unwrap_err();

    match error {
        OrchestratorError::AbortedByExit { instance: exited, progress, .. } => {
            assert_eq!(exited, instance("api", 1));
            assert_eq!(progress.completed, ids(&["db", "cache", "api"]));
        }
        other => panic!("expected abort, got {:?}", other),
    }

    for service in ["db", "cache", "api"] {
        assert_eq!(runtime.state_of(&instance(service, 1)), InstanceState::Stopped);
    }

    // The batch is stopped in reverse order; `api` had already exited.
    let stops = runtime
        .mutations()
        .into_iter()
        .filter(|call| matches!(call, RuntimeCall::Stop(_)))
        .collect::<Vec<_>>();
    assert_eq!(stops, vec![stop("cache", 1), stop("db", 1)]);
}

#[tokio::test]
async fn attached_start_waits_for_instances_to_exit() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);

    let exiter = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            runtime.exit_instance(&instance("db", 1));
        })
    };

    let options = overrides(&[("detach", "false"), ("no-deps", "true")]);
    let progress = orchestrator.start_service("db", 1, &options).await.unwrap();
    exiter.await.unwrap();

    assert_eq!(progress.completed, ids(&["db"]));
    assert_eq!(runtime.state_of(&instance("db", 1)), InstanceState::Stopped);

    let inspections = runtime
        .journal()
        .into_iter()
        .filter(|call| *call == RuntimeCall::Inspect(instance("db", 1)))
        .count();
    assert!(inspections > 2, "expected repeated inspections, got {}", inspections);
}

#[tokio::test]
async fn orphans_are_removed_on_request() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.insert_instance(instance("legacy", 1), InstanceState::Running, "unknown");
    let orchestrator = orchestrator(web_stack(), &runtime);
    orchestrator.start_all(&OptionSet::default()).await.unwrap();

    orchestrator.stop_all(&OptionSet::default()).await.unwrap();
    assert_eq!(runtime.state_of(&instance("legacy", 1)), InstanceState::Running);

    runtime.clear_journal();
    let options = overrides(&[("remove-orphans", "true")]);
    orchestrator.stop_all(&options).await.unwrap();
    assert_eq!(runtime.mutations(), vec![stop("legacy", 1), remove("legacy", 1, false)]);
    assert_eq!(runtime.state_of(&instance("legacy", 1)), InstanceState::Absent);
}

#[tokio::test]
async fn stop_removal_follows_options_and_policy() {
    let topology = Arc::new(
        Topology::load([
            ServiceDefinition::new("keeper").with_recreate_policy(RecreatePolicy::Never),
            ServiceDefinition::new("worker"),
        ])
        .unwrap(),
    );
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(topology, &runtime);
    orchestrator.start_all(&OptionSet::default()).await.unwrap();

    // A `never` service persists stopped.
    runtime.clear_journal();
    orchestrator.stop_service("keeper", &OptionSet::default()).await.unwrap();
    assert_eq!(runtime.mutations(), vec![stop("keeper", 1)]);
    assert_eq!(runtime.state_of(&instance("keeper", 1)), InstanceState::Stopped);

    // ... unless volumes or images are to be removed.
    runtime.clear_journal();
    let options = overrides(&[("volumes", "true"), ("rmi", "all")]);
    orchestrator.stop_service("keeper", &options).await.unwrap();
    assert_eq!(
        runtime.mutations(),
        vec![
            remove("keeper", 1, true),
            RuntimeCall::RemoveImages {
                service: id("keeper"),
                policy: ImageRemoval::All,
            },
        ]
    );
}

#[tokio::test]
async fn stopped_instances_are_reused() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let topology = web_stack();
    let fingerprint = topology.get("db").unwrap().fingerprint().to_string();
    runtime.insert_instance(instance("db", 1), InstanceState::Stopped, &fingerprint);
    let orchestrator = orchestrator(topology, &runtime);

    orchestrator
        .start_service("db", 1, &OptionSet::default())
        .await
        .unwrap();
    assert_eq!(runtime.mutations(), vec![start("db", 1)]);
}

#[tokio::test]
async fn changed_definitions_are_recreated_when_allowed() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.insert_instance(instance("db", 1), InstanceState::Running, "stale");
    let orchestrator = orchestrator(web_stack(), &runtime);

    // Running instances are left alone by default.
    orchestrator
        .start_service("db", 1, &OptionSet::default())
        .await
        .unwrap();
    assert_eq!(runtime.mutations(), Vec::new());

    let options = overrides(&[("no-recreate", "false")]);
    orchestrator.start_service("db", 1, &options).await.unwrap();
    assert_eq!(
        runtime.mutations(),
        vec![stop("db", 1), remove("db", 1, false), create("db", &[1]), start("db", 1)]
    );

    // The recreated instance is current, so a second pass changes nothing.
    runtime.clear_journal();
    orchestrator.start_service("db", 1, &options).await.unwrap();
    assert_eq!(runtime.mutations(), Vec::new());
}

#[tokio::test]
async fn forced_recreation_targets_and_dependencies() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);
    orchestrator.start_all(&OptionSet::default()).await.unwrap();

    runtime.clear_journal();
    let options = overrides(&[("force-recreate", "true")]);
    orchestrator.start_service("api", 1, &options).await.unwrap();
    assert_eq!(
        runtime.mutations(),
        vec![stop("api", 1), remove("api", 1, false), create("api", &[1]), start("api", 1)]
    );

    runtime.clear_journal();
    let options = overrides(&[("always-recreate-deps", "true")]);
    orchestrator.start_service("api", 1, &options).await.unwrap();
    assert_eq!(
        runtime.mutations(),
        vec![
            stop("db", 1),
            remove("db", 1, false),
            create("db", &[1]),
            start("db", 1),
            stop("cache", 1),
            remove("cache", 1, false),
            create("cache", &[1]),
            start("cache", 1),
        ]
    );
}

#[tokio::test]
async fn scaling_down_removes_surplus_instances() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let orchestrator = orchestrator(web_stack(), &runtime);
    orchestrator
        .start_service("api", 3, &OptionSet::default())
        .await
        .unwrap();

    runtime.clear_journal();
    orchestrator
        .start_service("api", 1, &OptionSet::default())
        .await
        .unwrap();
    assert_eq!(
        runtime.mutations(),
        vec![stop("api", 2), remove("api", 2, false), stop("api", 3), remove("api", 3, false)]
    );
    assert_eq!(runtime.state_of(&instance("api", 1)), InstanceState::Running);
}

#[tokio::test]
async fn transitional_states_settle_or_time_out() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.hold_state(&instance("db", 1), InstanceState::Creating, 3);
    let orchestrator = orchestrator(web_stack(), &runtime);

    orchestrator
        .start_service("db", 1, &OptionSet::default())
        .await
        .unwrap();
    assert_eq!(runtime.state_of(&instance("db", 1)), InstanceState::Running);

    runtime.hold_state(&instance("db", 1), InstanceState::Stopping, usize::MAX);
    let orchestrator = Orchestrator::new(
        web_stack(),
        runtime.clone(),
        fast_config()
            .with_call_timeout(Duration::from_millis(30))
            .with_settle_interval(Duration::from_millis(5)),
    );

    let error = orchestrator
        .stop_service("db", &overrides(&[("no-deps", "true")]))
        .await
        .unwrap_err();
    match error {
        OrchestratorError::RuntimeCall { source, .. } => {
            assert!(source.is_timeout());
            assert_eq!(source.operation(), RuntimeOperation::Inspect);
        }
        other => panic!("expected settle timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn independent_services_start_concurrently() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.inject_delay(RuntimeOperation::Start, Duration::from_millis(20));
    let orchestrator = Orchestrator::new(web_stack(), runtime.clone(), fast_config().with_max_parallelism(4));

    let plan = orchestrator.plan_start(None, &OptionSet::default()).unwrap();
    assert_eq!(plan.ranks(), vec![ids(&["db", "cache"]), ids(&["api"])]);

    let progress = orchestrator.start_all(&OptionSet::default()).await.unwrap();
    assert_eq!(progress.completed.len(), 3);
    assert_eq!(progress.completed.last(), Some(&id("api")));

    // Both rank-0 services are created before either of them finishes starting.
    let mutations = runtime.mutations();
    assert!(matches!(&mutations[0], RuntimeCall::Create { .. }));
    assert!(matches!(&mutations[1], RuntimeCall::Create { .. }));
    assert_eq!(mutations.last(), Some(&start("api", 1)));
}

#[tokio::test]
async fn concurrent_failure_skips_later_ranks() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.inject_failure(RuntimeOperation::Create, "db");
    let orchestrator = Orchestrator::new(web_stack(), runtime.clone(), fast_config().with_max_parallelism(4));

    let error = orchestrator.start_all(&OptionSet::default()).await.unwrap_err();
    let progress = error.progress().cloned().unwrap();
    assert_eq!(progress.failed, ids(&["db"]));
    assert!(progress.not_attempted.contains(&id("api")));
    assert_eq!(runtime.state_of(&instance("api", 1)), InstanceState::Absent);
}

#[tokio::test]
async fn exec_runs_in_running_instances_only() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.set_exec_exit_code(7);
    let orchestrator = orchestrator(web_stack(), &runtime);

    let request = ExecRequest {
        command: vec!["pg_isready".to_string()],
        privileged: false,
        workdir: Some("/tmp".to_string()),
    };

    let result = orchestrator.exec("db", 1, &request).await;
    assert!(matches!(
        result,
        Err(OrchestratorError::ServiceNotRunning {
            state: InstanceState::Absent,
            ..
        })
    ));

    orchestrator
        .start_service("db", 1, &OptionSet::default())
        .await
        .unwrap();
    assert_eq!(orchestrator.exec("db", 1, &request).await.unwrap(), 7);

    let result = orchestrator.exec("nope", 1, &request).await;
    assert!(matches!(result, Err(OrchestratorError::Plan { .. })));
}
