#[cfg(test)]
mod tests {
    use bastion_core::{BastionError, PluginId};
    use bastion_permissions::PermissionStore;
    use bastion_plugin::sandbox::services::HostServices;
    use bastion_plugin::sandbox::{
        CodeUnit, ExecutionRequest, Resource, ResourceCeiling, SandboxExecutor, SandboxFailure, SandboxOptions,
        ScopedServices,
    };
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const MIB: usize = 1024 * 1024;

    const NOOP: &str = r#"(module (func (export "run")))"#;

    const SPIN: &str = r#"(module (func (export "run") (loop $l (br $l))))"#;

    const GROW: &str = r#"
        (module
          (memory 1)
          (func (export "run") (drop (memory.grow (i32.const 64)))))"#;

    const UNREACHABLE: &str = r#"(module (func (export "run") unreachable))"#;

    const HELLO: &str = r#"
        (module
          (import "bastion" "print" (func $print (param i32 i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "hello from plugin")
          (func (export "run") (call $print (i32.const 0) (i32.const 17))))"#;

    const WRITE_FILE: &str = r#"
        (module
          (import "bastion" "fs_write" (func $write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "out.txt")
          (data (i32.const 16) "data")
          (func (export "run")
            (drop (call $write (i32.const 0) (i32.const 7) (i32.const 16) (i32.const 4)))))"#;

    const ESCAPE: &str = r#"
        (module
          (import "bastion" "fs_write" (func $write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "../x.txt")
          (func (export "run")
            (drop (call $write (i32.const 0) (i32.const 8) (i32.const 0) (i32.const 1)))))"#;

    const DUNDER: &str = r#"
        (module
          (import "bastion" "attr_get" (func $attr (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "obj.__class__")
          (func (export "run")
            (drop (call $attr (i32.const 0) (i32.const 13) (i32.const 64) (i32.const 64)))))"#;

    const ECHO: &str = r#"
        (module
          (import "bastion" "ctx_get" (func $get (param i32 i32 i32 i32) (result i32)))
          (import "bastion" "bind" (func $bind (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "name")
          (data (i32.const 8) "greeting")
          (func (export "run") (local $n i32)
            (local.set $n (call $get (i32.const 0) (i32.const 4) (i32.const 64) (i32.const 256)))
            (drop (call $bind (i32.const 8) (i32.const 8) (i32.const 64) (local.get $n)))))"#;

    fn id(s: &str) -> PluginId {
        PluginId::new(s).unwrap()
    }

    fn executor(data_root: &Path) -> (Arc<PermissionStore>, Arc<SandboxExecutor>) {
        let store = Arc::new(PermissionStore::in_memory());
        let services: Arc<dyn HostServices> = Arc::new(ScopedServices::new(data_root));
        let exec = SandboxExecutor::new(Arc::clone(&store), services, SandboxOptions::default()).unwrap();
        (store, Arc::new(exec))
    }

    /// Inline request for `plugin`, loading a no-op module for it first if
    /// nothing is loaded yet.
    fn inline(exec: &SandboxExecutor, plugin: &PluginId, wat: &str, ceiling: ResourceCeiling) -> ExecutionRequest {
        if !exec.is_loaded(plugin) {
            exec.load(plugin, NOOP.as_bytes()).unwrap();
        }
        ExecutionRequest::new(plugin.clone(), CodeUnit::Inline(wat.as_bytes().to_vec()), ceiling)
    }

    fn wait_for_in_flight(exec: &SandboxExecutor, plugin: &PluginId) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while exec.in_flight(plugin) == 0 {
            assert!(Instant::now() < deadline, "execution never started");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    // ── Basic execution ────────────────────────────────────────

    #[test]
    fn test_noop_succeeds_with_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let result = exec.execute(inline(&exec, &id("a.noop"), NOOP, ResourceCeiling::default()));
        assert!(result.is_success(), "{:?}", result.outcome);
        assert!(result.output.is_empty());
        assert!(!result.output_truncated);
    }

    #[test]
    fn test_print_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let result = exec.execute(inline(&exec, &id("a.hello"), HELLO, ResourceCeiling::default()));
        assert!(result.is_success(), "{:?}", result.outcome);
        assert_eq!(result.output, "hello from plugin");
    }

    #[test]
    fn test_context_read_and_bind() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let request = inline(&exec, &id("a.echo"), ECHO, ResourceCeiling::default()).with_var("name", serde_json::json!("world"));
        let result = exec.execute(request);
        assert!(result.is_success(), "{:?}", result.outcome);
        assert_eq!(result.bindings.get("greeting"), Some(&serde_json::json!("world")));
    }

    #[test]
    fn test_trap_is_runtime_fault() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let result = exec.execute(inline(&exec, &id("a.trap"), UNREACHABLE, ResourceCeiling::default()));
        assert!(matches!(result.failure(), Some(SandboxFailure::RuntimeFault { .. })));
    }

    #[test]
    fn test_garbage_code_is_runtime_fault() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let result = exec.execute(inline(&exec, &id("a.junk"), "(module (func", ResourceCeiling::default()));
        assert!(matches!(result.failure(), Some(SandboxFailure::RuntimeFault { .. })));
    }

    #[test]
    fn test_entry_requires_loaded_module() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let p = id("a.entry");
        let request = ExecutionRequest::new(p.clone(), CodeUnit::Entry("run".into()), ResourceCeiling::default());
        assert!(matches!(exec.execute(request.clone()).failure(), Some(SandboxFailure::RuntimeFault { .. })));

        exec.load(&p, NOOP.as_bytes()).unwrap();
        assert!(exec.is_loaded(&p));
        assert!(exec.execute(request).is_success());
    }

    #[test]
    fn test_inline_requires_loaded_module() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let p = id("a.gone");
        exec.load(&p, NOOP.as_bytes()).unwrap();
        assert!(exec.unload(&p).unwrap());

        let request = ExecutionRequest::new(p.clone(), CodeUnit::Inline(HELLO.as_bytes().to_vec()), ResourceCeiling::default());
        let result = exec.execute(request);
        assert!(matches!(result.failure(), Some(SandboxFailure::RuntimeFault { .. })));
        assert!(result.output.is_empty());
        assert_eq!(exec.in_flight(&p), 0);
    }

    // ── Ceilings ───────────────────────────────────────────────

    #[test]
    fn test_cpu_ceiling_stops_infinite_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let p = id("a.spin");
        let started = Instant::now();
        let result = exec.execute(inline(&exec, &p, SPIN, ResourceCeiling::new(Duration::from_secs(1), 64 * MIB)));
        let elapsed = started.elapsed();

        assert!(matches!(
            result.failure(),
            Some(SandboxFailure::ResourceExceeded { resource: Resource::CpuTime, .. })
        ));
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert_eq!(exec.violations(&p), 1);
        exec.reset_violations(&p);
        assert_eq!(exec.violations(&p), 0);
    }

    #[test]
    fn test_memory_ceiling_stops_growth() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let result = exec.execute(inline(&exec, &id("a.grow"), GROW, ResourceCeiling::new(Duration::from_secs(5), MIB)));
        assert!(matches!(
            result.failure(),
            Some(SandboxFailure::ResourceExceeded { resource: Resource::Memory, .. })
        ));
    }

    #[test]
    fn test_ceiling_does_not_leak_into_next_execution() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let p = id("a.seq");
        let tight = exec.execute(inline(&exec, &p, GROW, ResourceCeiling::new(Duration::from_secs(5), MIB)));
        assert!(!tight.is_success());
        let roomy = exec.execute(inline(&exec, &p, GROW, ResourceCeiling::new(Duration::from_secs(5), 64 * MIB)));
        assert!(roomy.is_success(), "{:?}", roomy.outcome);
    }

    // ── Gated calls ────────────────────────────────────────────

    #[test]
    fn test_gated_call_without_grant_is_denied_without_side_effect() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let p = id("a.writer");
        let result = exec.execute(inline(&exec, &p, WRITE_FILE, ResourceCeiling::default()));
        assert_eq!(
            result.failure(),
            Some(&SandboxFailure::PermissionDenied {
                permission: "fs.write".into()
            })
        );
        assert!(!dir.path().join("a.writer").join("out.txt").exists());
    }

    #[test]
    fn test_gated_call_with_grant_writes_inside_plugin_root() {
        let dir = tempfile::tempdir().unwrap();
        let (store, exec) = executor(dir.path());
        let p = id("a.writer");
        store.grant(&p, "fs.write").unwrap();
        let result = exec.execute(inline(&exec, &p, WRITE_FILE, ResourceCeiling::default()));
        assert!(result.is_success(), "{:?}", result.outcome);
        assert_eq!(std::fs::read(dir.path().join("a.writer/out.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_path_escape_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let (store, exec) = executor(dir.path());
        let p = id("a.escape");
        store.grant(&p, "fs.write").unwrap();
        let result = exec.execute(inline(&exec, &p, ESCAPE, ResourceCeiling::default()));
        assert!(matches!(result.failure(), Some(SandboxFailure::PermissionDenied { .. })));
        assert!(!dir.path().join("x.txt").exists());
    }

    #[test]
    fn test_reflective_attribute_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let request = inline(&exec, &id("a.reflect"), DUNDER, ResourceCeiling::default())
            .with_var("obj", serde_json::json!({"__class__": "secret", "name": "ok"}));
        let result = exec.execute(request);
        assert_eq!(
            result.failure(),
            Some(&SandboxFailure::PermissionDenied {
                permission: "reflection".into()
            })
        );
    }

    // ── In-flight tracking ─────────────────────────────────────

    #[test]
    fn test_cancel_stops_running_execution() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let p = id("a.cancel");

        let runner = {
            let exec = Arc::clone(&exec);
            let p = p.clone();
            std::thread::spawn(move || exec.execute(inline(&exec, &p, SPIN, ResourceCeiling::new(Duration::from_secs(30), 64 * MIB))))
        };
        wait_for_in_flight(&exec, &p);
        assert_eq!(exec.cancel(&p), 1);

        let result = runner.join().unwrap();
        assert_eq!(result.failure(), Some(&SandboxFailure::Cancelled));
        assert!(exec.wait_idle(&p, Duration::from_secs(1)));
        assert_eq!(exec.violations(&p), 0);
    }

    #[test]
    fn test_unload_while_in_flight_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let p = id("a.busy");
        exec.load(&p, SPIN.as_bytes()).unwrap();

        let runner = {
            let exec = Arc::clone(&exec);
            let p = p.clone();
            std::thread::spawn(move || {
                exec.execute(ExecutionRequest::new(
                    p,
                    CodeUnit::Entry("run".into()),
                    ResourceCeiling::new(Duration::from_secs(30), 64 * MIB),
                ))
            })
        };
        wait_for_in_flight(&exec, &p);

        let err = exec.unload(&p).unwrap_err();
        assert!(matches!(err, BastionError::Busy { in_flight: 1, .. }));
        assert!(exec.is_loaded(&p));

        exec.cancel(&p);
        runner.join().unwrap();
        assert!(exec.unload(&p).unwrap());
        assert!(!exec.is_loaded(&p));
    }

    #[test]
    fn test_plugins_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let (_, exec) = executor(dir.path());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let exec = Arc::clone(&exec);
                std::thread::spawn(move || exec.execute(inline(&exec, &id(&format!("a.p{i}")), HELLO, ResourceCeiling::default())))
            })
            .collect();
        for h in handles {
            let result = h.join().unwrap();
            assert_eq!(result.output, "hello from plugin");
        }
    }
}
