//! End-to-end scheduler tests against scripted and mocked engines.

use super::{NodeState, RunReport, Scheduler};
use crate::cancellation::CancellationToken;
use crate::component::Exports;
use crate::config::{FailureMode, RunConfig};
use crate::engine::{MockProvisioningEngine, OutputMap, ProvisioningEngine};
use crate::errors::{OutputError, StackError};
use crate::events::{
    CollectingEventSink, RESOURCE_CREATED, RESOURCE_CREATING, RESOURCE_SKIPPED, RESOURCE_WAITING,
    RUN_COMPLETED, RUN_STARTED,
};
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::output::Output;
use crate::resource::{BuildContext, ResourceId};
use crate::stack::Stack;
use crate::testing::{assert_created_before, assert_node_state, assert_run_succeeded, ScriptedEngine};
use pretty_assertions::assert_eq;
use serde_json::{json, Value as Json};
use std::sync::Arc;
use std::time::Duration;

fn graph_of(ctx: &BuildContext) -> DependencyGraph {
    GraphBuilder::new(ctx.stack())
        .extend(ctx.declarations())
        .build()
        .unwrap()
}

async fn execute(engine: Arc<dyn ProvisioningEngine>, ctx: &BuildContext, config: RunConfig) -> RunReport {
    Scheduler::new(engine)
        .with_config(config)
        .execute(&graph_of(ctx))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_interpolated_arn_waits_for_upstream() {
    let engine = Arc::new(ScriptedEngine::new().with_output("a", "id", json!("abc")));
    let events = Arc::new(CollectingEventSink::new());
    let ctx = BuildContext::new("dev");
    let a = ctx.resource("test:A", "a").register().unwrap();
    let b = ctx
        .resource("test:B", "b")
        .input("arn", crate::interpolate!("arn:%s", a.id()).unwrap())
        .register()
        .unwrap();

    let report = Scheduler::new(engine.clone())
        .with_event_sink(events.clone())
        .execute(&graph_of(&ctx))
        .await
        .unwrap();

    assert_run_succeeded(&report);
    assert_created_before(&report, &a, &b);
    assert_eq!(engine.request_for("b").unwrap().inputs["arn"], json!("arn:abc"));

    let a_created = events.position(RESOURCE_CREATED, a.resource_id().as_str()).unwrap();
    let b_creating = events.position(RESOURCE_CREATING, b.resource_id().as_str()).unwrap();
    assert!(a_created < b_creating);
}

#[tokio::test]
async fn test_event_sequence_for_one_resource() {
    let events = Arc::new(CollectingEventSink::new());
    let ctx = BuildContext::new("dev");
    let vpc = ctx.resource("aws:ec2:Vpc", "default").register().unwrap();

    Scheduler::new(Arc::new(ScriptedEngine::new()))
        .with_event_sink(events.clone())
        .execute(&graph_of(&ctx))
        .await
        .unwrap();

    assert_eq!(
        events.events_for(vpc.resource_id().as_str()),
        vec![RESOURCE_WAITING, RESOURCE_CREATING, RESOURCE_CREATED]
    );
    let types = events.event_types();
    assert_eq!(types.first().map(String::as_str), Some(RUN_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(RUN_COMPLETED));
}

#[tokio::test]
async fn test_every_node_created_exactly_once() {
    let mut engine = MockProvisioningEngine::new();
    engine
        .expect_create()
        .times(4)
        .returning(|_| Ok(OutputMap::new()));

    let ctx = BuildContext::new("dev");
    let top = ctx.resource("test:N", "top").register().unwrap();
    let left = ctx.resource("test:N", "left").depends_on(&top).register().unwrap();
    let right = ctx.resource("test:N", "right").depends_on(&top).register().unwrap();
    ctx.resource("test:N", "bottom")
        .depends_on(&left)
        .depends_on(&right)
        .register()
        .unwrap();

    let report = execute(Arc::new(engine), &ctx, RunConfig::default()).await;

    assert_run_succeeded(&report);
    assert_eq!(report.summary().total, 4);
    let order: Vec<&str> = report.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(order, vec!["top", "left", "right", "bottom"]);
}

#[tokio::test]
async fn test_cycle_rejected_before_any_engine_call() {
    let mut engine = MockProvisioningEngine::new();
    engine.expect_create().never();
    let stack = Stack::new("dev", Arc::new(engine));

    let err = stack
        .run(|ctx| {
            ctx.resource("test:N", "a")
                .depends_on_id(ResourceId::new("test:N", "c"))
                .register()?;
            ctx.resource("test:N", "b")
                .depends_on_id(ResourceId::new("test:N", "a"))
                .register()?;
            ctx.resource("test:N", "c")
                .depends_on_id(ResourceId::new("test:N", "b"))
                .register()?;
            Ok(Exports::new())
        })
        .await
        .unwrap_err();

    let StackError::Cycle(cycle) = err else {
        panic!("expected a cycle error, got {err}");
    };
    let names: Vec<&str> = cycle.resources().into_iter().map(ResourceId::as_str).collect();
    assert_eq!(names, vec!["test:N::a", "test:N::b", "test:N::c"]);
}

#[tokio::test]
async fn test_explicit_dependency_failure_skips_dependent() {
    let engine = Arc::new(ScriptedEngine::new().failing("d", "capacity unavailable"));
    let ctx = BuildContext::new("dev");
    let d = ctx.resource("test:D", "d").register().unwrap();
    let c = ctx.resource("test:C", "c").depends_on(&d).register().unwrap();

    let report = execute(engine.clone(), &ctx, RunConfig::default()).await;

    assert_node_state(&report, &d, NodeState::Failed);
    assert_node_state(&report, &c, NodeState::Skipped);
    assert!(engine.request_for("c").is_none());

    let Some(OutputError::Upstream(upstream)) = report.node(c.resource_id()).unwrap().error.clone() else {
        panic!("expected an upstream failure");
    };
    assert_eq!(&upstream.upstream, d.resource_id());
    assert!(matches!(upstream.root_cause(), OutputError::Provider(p) if p.message == "capacity unavailable"));

    match c.id().try_get() {
        Some(Err(OutputError::Upstream(_))) => {}
        other => panic!("expected c's outputs to fail upstream, got {other:?}"),
    }
}

#[tokio::test]
async fn test_skips_chain_to_the_original_failure() {
    let engine = Arc::new(ScriptedEngine::new().failing("db", "bad password"));
    let events = Arc::new(CollectingEventSink::new());
    let ctx = BuildContext::new("dev");
    let db = ctx.resource("aws:rds:Instance", "db").register().unwrap();
    let task = ctx
        .resource("aws:ecs:TaskDefinition", "task")
        .input("dbHost", db.output("address"))
        .register()
        .unwrap();
    let svc = ctx
        .resource("aws:ecs:Service", "svc")
        .input("taskDefinition", task.output("arn"))
        .register()
        .unwrap();

    let report = Scheduler::new(engine)
        .with_event_sink(events.clone())
        .execute(&graph_of(&ctx))
        .await
        .unwrap();

    let error = report.node(svc.resource_id()).unwrap().error.clone().unwrap();
    assert!(matches!(error.root_cause(), OutputError::Provider(p) if &p.resource == db.resource_id()));
    assert_eq!(events.events_of_type(RESOURCE_SKIPPED).len(), 2);
}

#[tokio::test]
async fn test_independent_branch_survives_failure() {
    let engine = Arc::new(ScriptedEngine::new().failing("bad", "boom"));
    let ctx = BuildContext::new("dev");
    let bad = ctx.resource("test:N", "bad").register().unwrap();
    let good = ctx.resource("test:N", "good").register().unwrap();

    let config = RunConfig::default().with_failure_mode(FailureMode::ContinueOnFailure);
    let report = execute(engine, &ctx, config).await;

    assert_node_state(&report, &bad, NodeState::Failed);
    assert_node_state(&report, &good, NodeState::Created);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_first_failure_skips_unstarted_nodes_by_default() {
    let engine = Arc::new(
        ScriptedEngine::new()
            .failing("bad", "boom")
            .with_delay_for("slow", Duration::from_millis(50)),
    );
    let ctx = BuildContext::new("dev");
    let bad = ctx.resource("test:N", "bad").register().unwrap();
    let slow = ctx.resource("test:N", "slow").register().unwrap();
    let after = ctx.resource("test:N", "after").depends_on(&slow).register().unwrap();

    let report = execute(engine.clone(), &ctx, RunConfig::default()).await;

    assert_node_state(&report, &slow, NodeState::Created);
    assert_node_state(&report, &after, NodeState::Skipped);
    assert!(engine.request_for("after").is_none());

    let Some(OutputError::Upstream(upstream)) = report.node(after.resource_id()).unwrap().error.clone() else {
        panic!("expected the skip to name the failed resource");
    };
    assert_eq!(&upstream.resource, after.resource_id());
    assert_eq!(&upstream.upstream, bad.resource_id());
    assert!(matches!(
        upstream.root_cause(),
        OutputError::Provider(p) if &p.resource == bad.resource_id() && p.message == "boom"
    ));
    assert!(matches!(after.id().try_get(), Some(Err(OutputError::Upstream(_)))));
}

#[tokio::test]
async fn test_continue_on_failure_runs_unrelated_nodes() {
    let engine = Arc::new(
        ScriptedEngine::new()
            .failing("bad", "boom")
            .with_delay_for("slow", Duration::from_millis(20)),
    );
    let ctx = BuildContext::new("dev");
    ctx.resource("test:N", "bad").register().unwrap();
    let slow = ctx.resource("test:N", "slow").register().unwrap();
    let after = ctx.resource("test:N", "after").depends_on(&slow).register().unwrap();

    let config = RunConfig::default().with_failure_mode(FailureMode::ContinueOnFailure);
    let report = execute(engine, &ctx, config).await;

    assert_node_state(&report, &after, NodeState::Created);
    assert_eq!(report.summary().failed, 1);
}

#[tokio::test]
async fn test_external_cancellation_skips_everything() {
    let token = CancellationToken::new();
    token.cancel("operator abort");
    let engine = Arc::new(ScriptedEngine::new());
    let ctx = BuildContext::new("dev");
    ctx.resource("test:N", "a").register().unwrap();
    ctx.resource("test:N", "b").register().unwrap();

    let report = Scheduler::new(engine.clone())
        .with_cancellation(token)
        .execute(&graph_of(&ctx))
        .await
        .unwrap();

    assert_eq!(report.summary().skipped, 2);
    assert!(report
        .nodes
        .iter()
        .all(|n| n.error == Some(OutputError::Cancelled("operator abort".to_string()))));
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let engine = Arc::new(ScriptedEngine::new().with_delay(Duration::from_millis(20)));
    let ctx = BuildContext::new("dev");
    for i in 0..6 {
        ctx.resource("test:N", format!("n{i}")).register().unwrap();
    }

    let report = execute(engine.clone(), &ctx, RunConfig::default().with_max_concurrency(2)).await;

    assert_run_succeeded(&report);
    assert_eq!(engine.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_independent_nodes_run_concurrently() {
    let engine = Arc::new(ScriptedEngine::new().with_delay(Duration::from_millis(20)));
    let ctx = BuildContext::new("dev");
    for i in 0..6 {
        ctx.resource("test:N", format!("n{i}")).register().unwrap();
    }

    execute(engine.clone(), &ctx, RunConfig::default().with_max_concurrency(0)).await;

    assert_eq!(engine.peak_concurrency(), 6);
}

#[tokio::test]
async fn test_engine_timeout_is_a_provider_failure() {
    let engine = Arc::new(ScriptedEngine::new().with_delay_for("slow", Duration::from_millis(500)));
    let ctx = BuildContext::new("dev");
    let slow = ctx.resource("test:N", "slow").register().unwrap();
    let next = ctx.resource("test:N", "next").input("upstream", slow.id()).register().unwrap();

    let config = RunConfig::default().with_engine_timeout(Duration::from_millis(20));
    let report = execute(engine, &ctx, config).await;

    assert_node_state(&report, &slow, NodeState::Failed);
    assert_node_state(&report, &next, NodeState::Skipped);
    let Some(OutputError::Provider(provider)) = report.node(slow.resource_id()).unwrap().error.clone() else {
        panic!("expected a provider error");
    };
    assert!(provider.timed_out);
}

#[tokio::test]
async fn test_component_republishes_child_output() {
    let engine = Arc::new(ScriptedEngine::new().with_output("data/db", "address", json!("db.internal")));
    let ctx = BuildContext::new("dev");
    let component = ctx
        .component("stackform:Database", "data")
        .build(|scope| {
            let db = scope.resource("aws:rds:Instance", "db").register()?;
            Ok(Exports::new().export("address", db.output("address")))
        })
        .unwrap();
    let app = ctx
        .resource("aws:ecs:TaskDefinition", "app")
        .input("dbHost", component.output("address").unwrap())
        .register()
        .unwrap();

    let report = execute(engine.clone(), &ctx, RunConfig::default()).await;

    assert_run_succeeded(&report);
    assert_eq!(engine.request_for("app").unwrap().inputs["dbHost"], json!("db.internal"));
    assert_eq!(component.output("address").unwrap().try_get(), Some(Ok(json!("db.internal"))));
    assert!(component.output("port").is_none());
    assert_node_state(&report, &app, NodeState::Created);
}

#[tokio::test]
async fn test_component_export_fails_with_child() {
    let engine = Arc::new(ScriptedEngine::new().failing("data/db", "boom"));
    let ctx = BuildContext::new("dev");
    let component = ctx
        .component("stackform:Database", "data")
        .build(|scope| {
            let db = scope.resource("aws:rds:Instance", "db").register()?;
            Ok(Exports::new().export("address", db.output("address")))
        })
        .unwrap();
    let app = ctx
        .resource("aws:ecs:TaskDefinition", "app")
        .input("dbHost", component.output("address").unwrap())
        .register()
        .unwrap();

    let report = execute(engine, &ctx, RunConfig::default()).await;

    assert_node_state(&report, &app, NodeState::Skipped);
    assert!(matches!(
        component.output("address").unwrap().try_get(),
        Some(Err(OutputError::Provider(_)))
    ));
}

#[tokio::test]
async fn test_caller_output_resolved_later() {
    let ctx = BuildContext::new("dev");
    let tag = Output::<Json>::pending();
    let bucket = ctx.resource("aws:s3:Bucket", "logs").input("tag", &tag).register().unwrap();

    let writer = tag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.resolve(json!("prod")).unwrap();
    });

    let engine = Arc::new(ScriptedEngine::new());
    let report = execute(engine.clone(), &ctx, RunConfig::default()).await;

    assert_node_state(&report, &bucket, NodeState::Created);
    assert_eq!(engine.request_for("logs").unwrap().inputs["tag"], json!("prod"));
}

#[tokio::test]
async fn test_caller_output_never_resolved_times_out() {
    let ctx = BuildContext::new("dev");
    let bucket = ctx
        .resource("aws:s3:Bucket", "logs")
        .input("tag", Output::<Json>::pending())
        .register()
        .unwrap();

    let config = RunConfig::default().with_input_timeout(Duration::from_millis(20));
    let report = execute(Arc::new(ScriptedEngine::new()), &ctx, config).await;

    assert_node_state(&report, &bucket, NodeState::Failed);
    assert!(matches!(
        report.node(bucket.resource_id()).unwrap().error,
        Some(OutputError::InputTimeout(_))
    ));
}

#[tokio::test]
async fn test_secret_outputs_stay_out_of_events_and_reports() {
    let engine = Arc::new(ScriptedEngine::new().with_output("db", "password", json!("hunter2")));
    let events = Arc::new(CollectingEventSink::new());
    let ctx = BuildContext::new("dev");
    let db = ctx
        .resource("aws:rds:Instance", "db")
        .secret_outputs(["password"])
        .register()
        .unwrap();
    ctx.resource("aws:ecs:TaskDefinition", "task")
        .input("dbPassword", db.output("password"))
        .register()
        .unwrap();

    let report = Scheduler::new(engine.clone())
        .with_event_sink(events.clone())
        .execute(&graph_of(&ctx))
        .await
        .unwrap();

    let request = engine.request_for("task").unwrap();
    assert_eq!(request.inputs["dbPassword"], json!("hunter2"));
    assert!(request.secret_inputs.contains("dbPassword"));
    assert!(!format!("{request:?}").contains("hunter2"));
    assert!(!report.to_dict().to_string().contains("hunter2"));
    assert!(!format!("{:?}", events.events()).contains("hunter2"));
}

#[tokio::test]
async fn test_echoed_secret_inputs_stay_redacted() {
    let mut engine = MockProvisioningEngine::new();
    engine
        .expect_create()
        .times(2)
        .returning(|request| Ok(request.inputs.clone()));
    engine.expect_delete().times(2).returning(|request| {
        assert!(!format!("{request:?}").contains("hunter2"));
        assert!(!serde_json::to_string(request).unwrap().contains("hunter2"));
        Ok(())
    });

    let ctx = BuildContext::new("dev");
    let password = Output::<Json>::secret(json!("hunter2"));
    let task = ctx
        .resource("aws:ecs:TaskDefinition", "task")
        .input("family", "app")
        .input("containerDefinitions", crate::interpolate!("postgres://u:%s@db", password).unwrap())
        .register()
        .unwrap();
    let reader = ctx
        .resource("test:Reader", "reader")
        .input("definitions", task.output("containerDefinitions"))
        .register()
        .unwrap();

    let scheduler = Scheduler::new(Arc::new(engine));
    let report = scheduler.execute(&graph_of(&ctx)).await.unwrap();

    assert_run_succeeded(&report);
    let node = report.node(task.resource_id()).unwrap();
    assert_eq!(node.outputs["containerDefinitions"], json!("postgres://u:hunter2@db"));
    assert!(node.secret_fields.contains("containerDefinitions"));
    assert!(!node.secret_fields.contains("family"));
    assert!(task.output("containerDefinitions").is_secret());
    assert!(report
        .node(reader.resource_id())
        .unwrap()
        .secret_fields
        .contains("definitions"));

    let text = report.to_dict().to_string();
    assert!(!text.contains("hunter2"));
    assert!(text.contains(r#""family":"app""#));

    let destroyed = scheduler.destroy(&report).await;
    assert!(destroyed.is_success());
}

#[tokio::test]
async fn test_input_skip_names_the_owner_that_failed() {
    let engine = Arc::new(ScriptedEngine::new());
    let ctx = BuildContext::new("dev");
    let a = ctx.resource("test:N", "a").register().unwrap();
    let b = ctx.resource("test:N", "b").register().unwrap();
    let pair = a.id().zip(&b.output("endpoint")).map(|(x, y)| json!([x, y]));
    let reader = ctx.resource("test:N", "reader").input("pair", pair).register().unwrap();

    let report = execute(engine.clone(), &ctx, RunConfig::default()).await;

    assert_node_state(&report, &reader, NodeState::Skipped);
    assert!(engine.request_for("reader").is_none());
    let Some(OutputError::Upstream(upstream)) = report.node(reader.resource_id()).unwrap().error.clone() else {
        panic!("expected an upstream failure");
    };
    assert_eq!(&upstream.upstream, b.resource_id());
    assert!(matches!(upstream.root_cause(), OutputError::Provider(p) if &p.resource == b.resource_id()));
}

#[tokio::test]
async fn test_report_records_fingerprint_and_timing() {
    let engine = Arc::new(ScriptedEngine::new());
    let ctx = BuildContext::new("dev");
    let sg = ctx
        .resource("aws:ec2:SecurityGroup", "web-sg")
        .input("port", 80)
        .register()
        .unwrap();

    let report = execute(engine.clone(), &ctx, RunConfig::default()).await;
    let node = report.node(sg.resource_id()).unwrap();

    assert_eq!(node.inputs_hash.as_deref(), Some(engine.calls()[0].inputs_hash.as_str()));
    assert!(node.started_at.is_some() && node.finished_at.is_some());
    assert!(node.duration_ms.is_some());
    assert_eq!(uuid::Uuid::parse_str(&report.run_id).ok().map(|u| u.get_version_num()), Some(7));
}
