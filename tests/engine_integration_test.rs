//! 引擎集成测试：通过 RuntimeContext 公共 API 驱动完整计划

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use hearth::config::AppConfig;
    use hearth::core::{ErrorKind, SessionStatus, StepState};
    use hearth::engine::{
        AutoApprove, AutoDeny, ChannelConfirmation, ConfirmationChannel, ConfirmationRequest, Decision,
        EngineEvent,
    };
    use hearth::plan::PlanBuilder;
    use hearth::snapshot::{ChainEntry, MemoryMetadataStore};
    use hearth::tools::{ParamType, Tool, ToolContext, ToolError, ToolManifest, ToolParameter, ToolRegistry};
    use hearth::{EngineError, RuntimeContext};

    struct EchoTool {
        manifest: ToolManifest,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                manifest: ToolManifest::new("test.echo", "Return the arguments")
                    .param(ToolParameter::optional("value", ParamType::Any))
                    .param(ToolParameter::optional("v", ParamType::Any))
                    .idempotent(true),
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn manifest(&self) -> &ToolManifest {
            &self.manifest
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    struct FailTool {
        manifest: ToolManifest,
    }

    #[async_trait]
    impl Tool for FailTool {
        fn manifest(&self) -> &ToolManifest {
            &self.manifest
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Err(ToolError::Failed("boom".into()))
        }
    }

    struct SleepTool {
        manifest: ToolManifest,
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn manifest(&self) -> &ToolManifest {
            &self.manifest
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept": ms }))
        }
    }

    /// 执行时先通知 started，再等待 release
    struct GateTool {
        manifest: ToolManifest,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Tool for GateTool {
        fn manifest(&self) -> &ToolManifest {
            &self.manifest
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(json!({ "released": true }))
        }
    }

    struct CountingConfirmation {
        calls: AtomicUsize,
        decision: Decision,
    }

    impl CountingConfirmation {
        fn new(decision: Decision) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                decision,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfirmationChannel for CountingConfirmation {
        async fn confirm(&self, _request: ConfirmationRequest) -> Decision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decision
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        work: PathBuf,
        ctx: Arc<RuntimeContext>,
    }

    fn fixture_with(configure: impl FnOnce(&mut AppConfig), extra: Vec<Arc<dyn Tool>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let work = root.join("work");
        fs::create_dir_all(&work).unwrap();

        let mut config = AppConfig::default();
        config.app.data_dir = Some(root.join("data"));
        config.snapshot.dir = Some(root.join("snapshots"));
        config.policy.allow = Vec::new();
        config.executor.tool_timeout_secs = 1;
        configure(&mut config);

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new()).unwrap();
        registry
            .register(FailTool {
                manifest: ToolManifest::new("test.fail", "Always fails").idempotent(true),
            })
            .unwrap();
        registry
            .register(SleepTool {
                manifest: ToolManifest::new("test.sleep", "Sleep for ms milliseconds")
                    .param(ToolParameter::required("ms", ParamType::Integer))
                    .idempotent(true),
            })
            .unwrap();
        for tool in extra {
            registry.register_arc(tool).unwrap();
        }

        let ctx = RuntimeContext::builder(config)
            .with_registry(registry)
            .with_metadata_store(Arc::new(MemoryMetadataStore::new()))
            .without_plugins()
            .build()
            .unwrap();
        Fixture {
            _dir: dir,
            root,
            work,
            ctx: Arc::new(ctx),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {}, Vec::new())
    }

    fn p(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn chain_entries(ctx: &RuntimeContext, sid: &str) -> Vec<ChainEntry> {
        match ctx.snapshots().chain(sid).await {
            Some(chain) => chain.entries().await,
            None => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_scenario_a_search_takes_no_snapshot() {
        let f = fixture();
        fs::write(f.work.join("budget-2024.xlsx"), b"a").unwrap();
        fs::create_dir_all(f.work.join("q3")).unwrap();
        fs::write(f.work.join("q3/Budget.xlsx"), b"b").unwrap();
        fs::write(f.work.join("budget.txt"), b"c").unwrap();

        let plan = PlanBuilder::new()
            .step(
                "filesystem.search",
                json!({"query": "budget", "ext": [".xlsx"], "path": p(&f.work)}),
            )
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoDeny).await.unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        let step = report.step(0).unwrap();
        assert_eq!(step.state, StepState::Done);
        assert_eq!(step.output.as_ref().unwrap()["count"], json!(2));
        assert!(!step.verdict.as_ref().unwrap().requires_snapshot);
        assert!(report.snapshot_ids.is_empty());
        assert!(chain_entries(&f.ctx, &report.session_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_scenario_b_bulk_delete_snapshot_and_rollback() {
        let f = fixture();
        let mut paths = Vec::new();
        for i in 0..23 {
            let file = f.work.join(format!("old-{:02}.log", i));
            fs::write(&file, format!("log line {}\n", i).repeat(i + 1)).unwrap();
            paths.push(p(&file));
        }

        let confirm = CountingConfirmation::new(Decision::Approve);
        let plan = PlanBuilder::new()
            .step("filesystem.delete", json!({ "paths": paths }))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &confirm).await.unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        let verdict = report.step(0).unwrap().verdict.clone().unwrap();
        assert!(!verdict.bulk_exceeded);
        assert_eq!(verdict.affected_items, 23);
        assert!(verdict.requires_snapshot);
        assert!(verdict.requires_confirmation);
        assert_eq!(confirm.calls(), 1);
        for path in &paths {
            assert!(!Path::new(path).exists());
        }

        let entries = chain_entries(&f.ctx, &report.session_id).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].snapshot().unwrap().target_paths.len(), 23);

        let rollback = f.ctx.rollback(&report.session_id, 1).await.unwrap();
        assert_eq!(rollback.restored_snapshot_ids(), vec![report.snapshot_ids[0].as_str()]);
        assert_eq!(rollback.remaining, 0);
        for (i, path) in paths.iter().enumerate() {
            assert_eq!(fs::read_to_string(path).unwrap(), format!("log line {}\n", i).repeat(i + 1));
        }
    }

    #[tokio::test]
    async fn test_scenario_c_denied_command_never_runs() {
        let f = fixture();
        let confirm = CountingConfirmation::new(Decision::Approve);
        let plan = PlanBuilder::new()
            .step("system.command", json!({"cmd": "rm -rf /"}))
            .step("test.echo", json!({"value": 1}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &confirm).await.unwrap();

        assert_eq!(report.status, SessionStatus::Failed);
        let step = report.step(0).unwrap();
        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::PermissionDenied);
        assert!(step.executed_at.is_none());
        assert_eq!(report.step(1).unwrap().state, StepState::Skipped);
        assert_eq!(report.halt.as_ref().unwrap().step, 0);
        assert_eq!(confirm.calls(), 0);
        assert!(chain_entries(&f.ctx, &report.session_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_waits_for_executing_step() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gate: Arc<dyn Tool> = Arc::new(GateTool {
            manifest: ToolManifest::new("test.gate", "Blocks until released").idempotent(true),
            started: started.clone(),
            release: release.clone(),
        });
        let f = fixture_with(|c| c.policy.confirm_writes = false, vec![gate]);
        let target = f.work.join("held.txt");
        fs::write(&target, "before").unwrap();

        let plan = PlanBuilder::new()
            .step("filesystem.write", json!({"path": p(&target), "content": "after"}))
            .step("test.gate", json!({}))
            .build()
            .unwrap();
        let sid = f.ctx.submit(plan).await.unwrap();
        let run = {
            let ctx = f.ctx.clone();
            let sid = sid.clone();
            tokio::spawn(async move { ctx.run(&sid, &AutoApprove).await })
        };
        started.notified().await;

        let rollback = {
            let ctx = f.ctx.clone();
            let sid = sid.clone();
            tokio::spawn(async move { ctx.rollback(&sid, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rollback.is_finished());
        assert_eq!(fs::read_to_string(&target).unwrap(), "after");

        release.notify_one();
        let report = run.await.unwrap().unwrap();
        assert!(report.is_success());
        let undone = rollback.await.unwrap().unwrap();
        assert_eq!(undone.restored_snapshot_ids().len(), 1);
        assert_eq!(fs::read_to_string(&target).unwrap(), "before");
    }

    #[tokio::test]
    async fn test_scenario_d_interrupt_after_second_step() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gate: Arc<dyn Tool> = Arc::new(GateTool {
            manifest: ToolManifest::new("test.gate", "Blocks until released").idempotent(true),
            started: started.clone(),
            release: release.clone(),
        });
        let f = fixture_with(|c| c.policy.confirm_writes = false, vec![gate]);
        let file = |i: usize| f.work.join(format!("f{}.txt", i));

        let plan = PlanBuilder::new()
            .step("filesystem.write", json!({"path": p(&file(0)), "content": "zero"}))
            .step("filesystem.write", json!({"path": p(&file(1)), "content": "one"}))
            .step("test.gate", json!({}))
            .step("filesystem.write", json!({"path": p(&file(3)), "content": "three"}))
            .step("filesystem.write", json!({"path": p(&file(4)), "content": "four"}))
            .build()
            .unwrap();
        let sid = f.ctx.submit(plan).await.unwrap();
        assert!(!f.ctx.interrupt(&sid).await.unwrap());

        let ctx = f.ctx.clone();
        let run_sid = sid.clone();
        let run = tokio::spawn(async move { ctx.run(&run_sid, &AutoApprove).await });

        started.notified().await;
        assert!(f.ctx.interrupt(&sid).await.unwrap());
        assert!(!f.ctx.interrupt(&sid).await.unwrap());
        release.notify_one();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.status, SessionStatus::Interrupted);
        assert!(report.interrupted);
        assert_eq!(
            report.states(),
            vec![
                StepState::Done,
                StepState::Done,
                StepState::Done,
                StepState::Skipped,
                StepState::Skipped
            ]
        );
        assert_eq!(report.skipped, 2);
        assert_eq!(report.snapshot_ids.len(), 2);
        assert!(!file(3).exists());
        assert!(!f.ctx.interrupt(&sid).await.unwrap());

        let rollback = f.ctx.rollback(&sid, 2).await.unwrap();
        assert_eq!(rollback.items.len(), 2);
        assert!(!file(0).exists());
        assert!(!file(1).exists());
    }

    #[tokio::test]
    async fn test_independent_step_continues_after_runtime_failure() {
        let f = fixture();
        let plan = PlanBuilder::new()
            .step("test.fail", json!({}))
            .step("test.echo", json!({"value": "still runs"}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();

        assert_eq!(report.states(), vec![StepState::Failed, StepState::Done]);
        assert_eq!(report.step(0).unwrap().error.as_ref().unwrap().kind, ErrorKind::ToolFailed);
        assert_eq!(report.status, SessionStatus::Failed);
        assert!(report.halt.is_none());
    }

    #[tokio::test]
    async fn test_step_referencing_failed_result_is_skipped() {
        let f = fixture();
        let plan = PlanBuilder::new()
            .step("test.fail", json!({}))
            .step("test.echo", json!({"value": {"$ref": 0}}))
            .step("test.echo", json!({"value": 3}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();

        assert_eq!(
            report.states(),
            vec![StepState::Failed, StepState::Skipped, StepState::Skipped]
        );
        assert!(report.step(1).unwrap().skip_reason.as_ref().unwrap().contains("failed step 0"));
        assert_eq!(report.halt.as_ref().unwrap().step, 1);
        assert_eq!(report.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_references_resolve_against_earlier_results() {
        let f = fixture();
        let plan = PlanBuilder::new()
            .step("test.echo", json!({"value": {"name": "/tmp/x"}}))
            .step("test.echo", json!({"v": "$result[0].value.name"}))
            .step("test.echo", json!({"v": {"$ref": 5}}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();

        assert_eq!(report.step(1).unwrap().output, Some(json!({"v": "/tmp/x"})));
        let third = report.step(2).unwrap();
        assert_eq!(third.state, StepState::Failed);
        assert_eq!(third.error.as_ref().unwrap().kind, ErrorKind::UnresolvedReference);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments_halt() {
        let f = fixture();
        let plan = PlanBuilder::new()
            .step("nope.tool", json!({}))
            .step("test.echo", json!({}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();
        assert_eq!(report.step(0).unwrap().error.as_ref().unwrap().kind, ErrorKind::UnknownTool);
        assert_eq!(report.step(1).unwrap().state, StepState::Skipped);

        let plan = PlanBuilder::new()
            .step("test.echo", json!({"zzz": 1}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();
        assert_eq!(
            report.step(0).unwrap().error.as_ref().unwrap().kind,
            ErrorKind::InvalidArguments
        );
    }

    #[tokio::test]
    async fn test_tool_timeout_is_recorded_and_plan_continues() {
        let f = fixture();
        let plan = PlanBuilder::new()
            .step("test.sleep", json!({"ms": 5000}))
            .step("test.echo", json!({"value": 1}))
            .build()
            .unwrap();
        let start = Instant::now();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(report.step(0).unwrap().error.as_ref().unwrap().kind, ErrorKind::ToolTimeout);
        assert_eq!(report.step(1).unwrap().state, StepState::Done);
    }

    #[tokio::test]
    async fn test_snapshot_is_captured_before_action() {
        let f = fixture_with(|c| c.policy.confirm_writes = false, Vec::new());
        let target = f.work.join("notes.txt");
        fs::write(&target, "original").unwrap();
        let mut rx = f.ctx.subscribe();

        let plan = PlanBuilder::new()
            .step("filesystem.write", json!({"path": p(&target), "content": "changed"}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "changed");

        let events = drain(&mut rx);
        let captured = events
            .iter()
            .position(|e| matches!(e, EngineEvent::SnapshotCaptured { step: 0, .. }))
            .unwrap();
        let executing = events
            .iter()
            .position(|e| matches!(e, EngineEvent::StepTransition { step: 0, state: StepState::Executing, .. }))
            .unwrap();
        assert!(captured < executing);

        let entries = chain_entries(&f.ctx, &report.session_id).await;
        let snapshot = entries[0].snapshot().unwrap();
        assert!(snapshot.created_at <= report.step(0).unwrap().executed_at.unwrap());

        f.ctx.rollback(&report.session_id, 1).await.unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_rollback_restores_newest_first() {
        let f = fixture_with(|c| c.policy.confirm_writes = false, Vec::new());
        let target = f.work.join("draft.txt");
        fs::write(&target, "v0").unwrap();

        let mut builder = PlanBuilder::new();
        for v in ["v1", "v2", "v3"] {
            builder = builder.step("filesystem.write", json!({"path": p(&target), "content": v}));
        }
        let report = f.ctx.execute(builder.build().unwrap(), &AutoApprove).await.unwrap();
        assert_eq!(report.snapshot_ids.len(), 3);
        assert_eq!(fs::read_to_string(&target).unwrap(), "v3");

        let first = f.ctx.rollback(&report.session_id, 1).await.unwrap();
        assert_eq!(first.restored_snapshot_ids(), vec![report.snapshot_ids[2].as_str()]);
        assert_eq!(fs::read_to_string(&target).unwrap(), "v2");

        let rest = f.ctx.rollback(&report.session_id, 10).await.unwrap();
        assert_eq!(
            rest.restored_snapshot_ids(),
            vec![report.snapshot_ids[1].as_str(), report.snapshot_ids[0].as_str()]
        );
        assert_eq!(rest.remaining, 0);
        assert_eq!(fs::read_to_string(&target).unwrap(), "v0");

        let err = f.ctx.rollback(&report.session_id, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::NothingToRollback(_)));
    }

    #[tokio::test]
    async fn test_corrupted_blob_fails_restore_and_keeps_chain() {
        let f = fixture_with(|c| c.policy.confirm_writes = false, Vec::new());
        let target = f.work.join("keep.txt");
        fs::write(&target, "before").unwrap();
        let plan = PlanBuilder::new()
            .step("filesystem.write", json!({"path": p(&target), "content": "after"}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();

        let objects = f.root.join("snapshots").join(&report.session_id).join("objects");
        let blobs: Vec<PathBuf> = walkdir::WalkDir::new(&objects)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        assert_eq!(blobs.len(), 1);
        fs::write(&blobs[0], "tampered").unwrap();

        let err = f.ctx.rollback(&report.session_id, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::RestoreFailed(_)));
        assert_eq!(chain_entries(&f.ctx, &report.session_id).await.len(), 1);
        assert_eq!(fs::read_to_string(&target).unwrap(), "after");
    }

    #[tokio::test]
    async fn test_user_denied_leaves_files_untouched() {
        let f = fixture();
        let target = f.work.join("precious.txt");
        fs::write(&target, "data").unwrap();
        let plan = PlanBuilder::new()
            .step("filesystem.delete", json!({"path": p(&target)}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoDeny).await.unwrap();

        assert_eq!(report.step(0).unwrap().error.as_ref().unwrap().kind, ErrorKind::UserDenied);
        assert!(target.exists());
        assert!(report.snapshot_ids.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_while_awaiting_confirmation() {
        let f = fixture();
        let target = f.work.join("pending.txt");
        fs::write(&target, "data").unwrap();
        let plan = PlanBuilder::new()
            .step("filesystem.delete", json!({"paths": [p(&target)]}))
            .step("test.echo", json!({}))
            .build()
            .unwrap();
        let sid = f.ctx.submit(plan).await.unwrap();

        let (channel, mut requests) = ChannelConfirmation::new(1);
        let ctx = f.ctx.clone();
        let run_sid = sid.clone();
        let run = tokio::spawn(async move { ctx.run(&run_sid, &channel).await });

        let pending = requests.recv().await.unwrap();
        assert_eq!(pending.request.tool_name, "filesystem.delete");
        assert!(f.ctx.interrupt(&sid).await.unwrap());
        let report = run.await.unwrap().unwrap();
        drop(pending);

        assert_eq!(report.status, SessionStatus::Interrupted);
        assert_eq!(report.states(), vec![StepState::Skipped, StepState::Skipped]);
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_irreversible_command_is_reported_on_rollback() {
        let f = fixture();
        let plan = PlanBuilder::new()
            .step("system.command", json!({"command": "echo hello"}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();
        let step = report.step(0).unwrap();
        assert_eq!(step.state, StepState::Done);
        assert!(!step.rollback_eligible);
        assert!(step.snapshot_id.is_none());

        let rollback = f.ctx.rollback(&report.session_id, 1).await.unwrap();
        assert_eq!(rollback.irreversible_steps(), vec![0]);
        assert!(rollback.restored_snapshot_ids().is_empty());
        assert_eq!(rollback.remaining, 0);
    }

    #[tokio::test]
    async fn test_network_tool_denied_by_default() {
        let f = fixture();
        let plan = PlanBuilder::new()
            .step("network.fetch", json!({"url": "https://example.com"}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();
        assert_eq!(
            report.step(0).unwrap().error.as_ref().unwrap().kind,
            ErrorKind::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_reloaded_policy_applies_to_new_sessions() {
        let f = fixture_with(|c| c.policy.confirm_writes = false, Vec::new());
        let target = f.work.join("a.txt");
        let plan = PlanBuilder::new()
            .step("filesystem.write", json!({"path": p(&target), "content": "x"}))
            .build()
            .unwrap();
        let before = f.ctx.submit(plan.clone()).await.unwrap();

        let mut section = f.ctx.config().policy.clone();
        section.confirm_writes = false;
        section.deny.push(format!("{}/**", p(&f.work)));
        f.ctx.reload_policy(&section).await.unwrap();

        let denied = f.ctx.execute(plan, &AutoApprove).await.unwrap();
        assert_eq!(
            denied.step(0).unwrap().error.as_ref().unwrap().kind,
            ErrorKind::PermissionDenied
        );
        let allowed = f.ctx.run(&before, &AutoApprove).await.unwrap();
        assert_eq!(allowed.status, SessionStatus::Completed);
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_session_records_and_close() {
        let f = fixture_with(|c| c.policy.confirm_writes = false, Vec::new());
        let target = f.work.join("b.txt");
        let plan = PlanBuilder::new()
            .goal("write a note")
            .step("filesystem.write", json!({"path": p(&target), "content": "x"}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();
        let sid = report.session_id.clone();

        let record = f.ctx.session_record(&sid).await.unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.goal.as_deref(), Some("write a note"));
        assert_eq!(record.snapshot_ids, report.snapshot_ids);
        assert!(f.ctx.list_sessions().await.unwrap().contains(&sid));
        assert!(matches!(
            f.ctx.run(&sid, &AutoApprove).await,
            Err(EngineError::InvalidState(_))
        ));

        f.ctx.close_session(&sid).await.unwrap();
        assert!(matches!(
            f.ctx.session_record(&sid).await,
            Err(EngineError::SessionNotFound(_))
        ));
        assert!(matches!(
            f.ctx.rollback(&sid, 1).await,
            Err(EngineError::SessionNotFound(_))
        ));
        assert!(!f.root.join("snapshots").join(&sid).exists());
    }

    #[tokio::test]
    async fn test_expired_snapshots_are_purged() {
        let f = fixture_with(
            |c| {
                c.policy.confirm_writes = false;
                c.snapshot.ttl_days = 0;
            },
            Vec::new(),
        );
        let target = f.work.join("c.txt");
        fs::write(&target, "old").unwrap();
        let plan = PlanBuilder::new()
            .step("filesystem.write", json!({"path": p(&target), "content": "new"}))
            .build()
            .unwrap();
        let report = f.ctx.execute(plan, &AutoApprove).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = f.ctx.expire_snapshots().await.unwrap();
        assert_eq!(expired.entries_removed, 1);
        assert!(matches!(
            f.ctx.rollback(&report.session_id, 1).await,
            Err(EngineError::NothingToRollback(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_plans() {
        let f = fixture();
        f.ctx.shutdown().await;
        let plan = PlanBuilder::new().step("test.echo", json!({})).build().unwrap();
        assert!(matches!(f.ctx.submit(plan).await, Err(EngineError::Shutdown)));
    }
}
