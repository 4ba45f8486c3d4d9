//! Lifecycle tests against a scripted engine: the monitor is a plain
//! child process and the init process is faked with a `cat` whose
//! argv[0] is the init sentinel. No engine or elevated privileges are
//! required.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use liblxcri::container::{ContainerStatus, INIT_SENTINEL};
use liblxcri::engine::test::TestEngine;
use liblxcri::engine::EngineState;
use liblxcri::error::Error;
use liblxcri::{bundle, Container, ContainerConfig, Context, Runtime, EXEC_HOOK, EXEC_INIT, EXEC_START};
use oci_spec::runtime::{LinuxIdMappingBuilder, Spec};

struct TestEnv {
    engine: TestEngine,
    runtime: Runtime,
    rootfs: PathBuf,
    _dir: tempfile::TempDir,
}

fn minimal_spec(rootfs: &Path) -> Result<Spec> {
    Ok(bundle::new_spec(rootfs, &["/sleep", "30"])?)
}

fn test_env() -> Result<TestEnv> {
    let dir = tempfile::tempdir()?;
    let rootfs = dir.path().join("rootfs");
    std::fs::create_dir_all(&rootfs)?;

    use std::os::unix::fs::PermissionsExt;
    let libexec = dir.path().join("libexec");
    std::fs::create_dir_all(&libexec)?;
    for name in [EXEC_START, EXEC_HOOK, EXEC_INIT] {
        let path = libexec.join(name);
        std::fs::write(&path, "#!/bin/sh\nexec /bin/sleep 30\n")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }

    let engine = TestEngine::new();
    let mut runtime = Runtime::with_engine(
        dir.path().join("run"),
        libexec,
        Box::new(engine.clone()),
    );
    runtime.cgroup_root = dir.path().join("cgroup");
    runtime.privileged = true;
    std::fs::create_dir_all(&runtime.root)?;
    std::fs::create_dir_all(&runtime.cgroup_root)?;

    Ok(TestEnv {
        engine,
        runtime,
        rootfs,
        _dir: dir,
    })
}

/// A process whose /proc cmdline is exactly the init sentinel: `cat`
/// renamed via arg0, blocked on its stdin pipe.
fn spawn_fake_init() -> Result<Child> {
    Command::new("/bin/cat")
        .arg0(INIT_SENTINEL)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn fake init")
}

fn created_container(env: &TestEnv, id: &str) -> Result<(Container, Child)> {
    let fake_init = spawn_fake_init()?;
    env.engine.set_state(EngineState::Running);
    env.engine.set_init_pid(Some(fake_init.id() as i32));

    let config = ContainerConfig {
        container_id: id.to_string(),
        bundle_path: env.rootfs.parent().unwrap().to_path_buf(),
        spec: minimal_spec(&env.rootfs)?,
        ..Default::default()
    };

    let ctx = Context::with_timeout(Duration::from_secs(10));
    let container = env.runtime.create(&ctx, config).map_err(|err| err.error)?;
    Ok((container, fake_init))
}

fn reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn test_create_materializes_runtime_directory() -> Result<()> {
    let env = test_env()?;
    let (container, fake_init) = created_container(&env, "c1")?;

    let rundir = env.runtime.root.join("c1");
    for file in [
        "config",
        "config.json",
        "hooks.json",
        "state.json",
        "lxcri.json",
        "syncfifo",
        "cmdline",
        "environ",
    ] {
        assert!(rundir.join(file).exists(), "missing {file}");
    }
    assert!(rundir.join("cwd").is_symlink());

    // the ordered sweep reached the engine
    assert_eq!(
        env.engine.item("lxc.rootfs.path"),
        Some(env.rootfs.display().to_string())
    );
    assert_eq!(env.engine.item("lxc.rootfs.managed"), Some("0".to_string()));
    assert_eq!(env.engine.item("lxc.autodev"), Some("0".to_string()));
    assert_eq!(env.engine.item("lxc.init.cmd"), Some("/.lxcri/lxcri-init".to_string()));
    assert_eq!(
        env.engine.item("lxc.namespace.clone"),
        Some("pid mnt ipc uts cgroup net".to_string())
    );
    // no console socket and no terminal: stdio stays inherited
    assert_eq!(env.engine.item("lxc.console.path"), Some("none".to_string()));

    // the container cgroup was claimed
    assert!(env.runtime.cgroup_root.join("lxcri").join("c1").is_dir());

    assert_eq!(container.status()?, ContainerStatus::Created);
    assert!(container.monitor_pid > 1);
    assert!(container.is_monitor_running());

    reap(fake_init);
    Ok(())
}

#[test]
fn test_create_twice_fails() -> Result<()> {
    let env = test_env()?;
    let (_container, fake_init) = created_container(&env, "c1")?;

    let config = ContainerConfig {
        container_id: "c1".to_string(),
        bundle_path: env.rootfs.clone(),
        spec: minimal_spec(&env.rootfs)?,
        ..Default::default()
    };
    let ctx = Context::with_timeout(Duration::from_secs(5));
    match env.runtime.create(&ctx, config) {
        Err(err) => {
            assert!(matches!(&err.error, Error::InvalidConfig(msg) if msg.contains("already exists")));
            // nothing was materialized for the second create
            assert!(err.container.is_none());
        }
        Ok(_) => bail!("expected InvalidConfig"),
    }

    reap(fake_init);
    Ok(())
}

// The start verb must not return before the FIFO writer has closed and
// the init left the sentinel state.
#[test]
fn test_start_handshake() -> Result<()> {
    let env = test_env()?;
    let (mut container, fake_init) = created_container(&env, "c1")?;
    assert_eq!(container.status()?, ContainerStatus::Created);

    let fifo = env.runtime.root.join("c1").join("syncfifo");
    let engine = env.engine.clone();
    let (eof_sender, eof_receiver) = mpsc::channel();

    // the container-side init: blocks on the FIFO until the runtime
    // closes the write side, then "execs" into the user process
    let init_side = std::thread::spawn(move || -> std::io::Result<()> {
        use std::io::Read;
        let mut reader = std::fs::File::open(&fifo)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        // exec: the sentinel process is replaced by the user process
        engine.set_init_pid(Some(std::process::id() as i32));
        eof_sender.send(()).ok();
        Ok(())
    });

    let ctx = Context::with_timeout(Duration::from_secs(10));
    env.runtime.start(&ctx, &mut container)?;

    // start returned, so the reader must have seen EOF already
    eof_receiver
        .recv_timeout(Duration::from_secs(1))
        .context("start returned before the fifo handshake completed")?;
    init_side.join().unwrap()?;

    assert_eq!(container.status()?, ContainerStatus::Running);

    // starting twice is an illegal state transition
    match env.runtime.start(&ctx, &mut container) {
        Err(Error::IllegalState { .. }) => {}
        other => bail!("expected IllegalState, got {other:?}"),
    }

    reap(fake_init);
    Ok(())
}

#[test]
fn test_kill_requires_live_container() -> Result<()> {
    let env = test_env()?;
    let (mut container, fake_init) = created_container(&env, "c1")?;

    let ctx = Context::with_timeout(Duration::from_secs(5));
    let sigusr1 = "USR1".parse().unwrap();

    // created containers may be signalled
    env.runtime.kill(&ctx, &mut container, sigusr1)?;

    // stopped containers may not
    env.engine.set_state(EngineState::Stopped);
    match env.runtime.kill(&ctx, &mut container, sigusr1) {
        Err(Error::IllegalState { .. }) => {}
        other => bail!("expected IllegalState, got {other:?}"),
    }

    reap(fake_init);
    Ok(())
}

#[test]
fn test_delete_lifecycle() -> Result<()> {
    let env = test_env()?;
    let (container, fake_init) = created_container(&env, "c1")?;
    let rundir = env.runtime.root.join("c1");
    drop(container);

    let ctx = Context::with_timeout(Duration::from_secs(10));

    // a created (not stopped) container needs force
    match env.runtime.delete(&ctx, "c1", false) {
        Err(Error::IllegalState { .. }) => {}
        other => bail!("expected IllegalState, got {other:?}"),
    }
    assert!(rundir.exists());

    env.runtime.delete(&ctx, "c1", true)?;
    assert!(!rundir.exists());
    assert!(env.engine.destroyed());

    // absorbing: deleting again (and deleting unknown ids) succeeds
    env.runtime.delete(&ctx, "c1", true)?;
    env.runtime.delete(&ctx, "never-created", false)?;

    reap(fake_init);
    Ok(())
}

// An unprivileged runtime injects a user namespace and forwards the id
// mappings to the engine.
#[test]
fn test_unprivileged_user_namespace() -> Result<()> {
    let mut env = test_env()?;
    env.runtime.privileged = false;

    let fake_init = spawn_fake_init()?;
    env.engine.set_state(EngineState::Running);
    env.engine.set_init_pid(Some(fake_init.id() as i32));

    let mut spec = minimal_spec(&env.rootfs)?;
    let mut linux = spec.linux().clone().unwrap();
    linux.set_uid_mappings(Some(vec![LinuxIdMappingBuilder::default()
        .container_id(0u32)
        .host_id(20000u32)
        .size(65536u32)
        .build()?]));
    spec.set_linux(Some(linux));

    let config = ContainerConfig {
        container_id: "c1".to_string(),
        bundle_path: env.rootfs.clone(),
        spec,
        ..Default::default()
    };
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let _container = env.runtime.create(&ctx, config).map_err(|err| err.error)?;

    let clone = env.engine.item("lxc.namespace.clone").unwrap();
    assert!(clone.contains("user"), "user namespace missing in {clone:?}");
    assert_eq!(
        env.engine.item("lxc.idmap"),
        Some("u 0 20000 65536".to_string())
    );

    reap(fake_init);
    Ok(())
}

// A spec without namespaces never materializes a runtime directory.
#[test]
fn test_invalid_spec_leaves_no_state() -> Result<()> {
    let env = test_env()?;
    let mut spec = minimal_spec(&env.rootfs)?;
    let mut linux = spec.linux().clone().unwrap();
    linux.set_namespaces(Some(vec![]));
    spec.set_linux(Some(linux));

    let config = ContainerConfig {
        container_id: "c1".to_string(),
        bundle_path: env.rootfs.clone(),
        spec,
        ..Default::default()
    };
    let ctx = Context::with_timeout(Duration::from_secs(5));
    match env.runtime.create(&ctx, config) {
        Err(err) => {
            assert!(matches!(err.error, Error::InvalidConfig(_)));
            assert!(err.container.is_none());
        }
        Ok(_) => bail!("expected InvalidConfig"),
    }
    assert!(!env.runtime.root.join("c1").exists());
    Ok(())
}

// Two containers competing for the same cgroup path: the second create
// fails and the first stays intact.
#[test]
fn test_cgroup_collision() -> Result<()> {
    let env = test_env()?;
    let (container, fake_init) = created_container(&env, "c1")?;

    // simulate the first container's processes in its cgroup
    let cgroup_dir = env.runtime.cgroup_root.join("lxcri").join("c1");
    std::fs::write(cgroup_dir.join("cgroup.procs"), "12345\n")?;

    let mut spec = minimal_spec(&env.rootfs)?;
    let mut linux = spec.linux().clone().unwrap();
    linux.set_cgroups_path(Some(PathBuf::from("lxcri/c1")));
    spec.set_linux(Some(linux));

    let config = ContainerConfig {
        container_id: "c2".to_string(),
        bundle_path: env.rootfs.clone(),
        spec,
        ..Default::default()
    };
    let ctx = Context::with_timeout(Duration::from_secs(5));
    match env.runtime.create(&ctx, config) {
        Err(err) => {
            assert!(matches!(err.error, Error::Engine(_)));
            // the failed create hands back the partial container for cleanup
            assert_eq!(err.container_id(), Some("c2"));
        }
        Ok(_) => bail!("expected an engine failure"),
    }

    // the first container is untouched
    assert_eq!(container.status()?, ContainerStatus::Created);

    reap(fake_init);
    Ok(())
}

// A dying monitor fails the create rendezvous.
#[test]
fn test_create_fails_when_monitor_dies() -> Result<()> {
    let env = test_env()?;

    // monitor exits immediately
    let monitor = env.runtime.libexec_dir.join(EXEC_START);
    std::fs::write(&monitor, "#!/bin/sh\nexit 1\n")?;

    env.engine.set_state(EngineState::Starting);
    env.engine.set_init_pid(None);

    let config = ContainerConfig {
        container_id: "c1".to_string(),
        bundle_path: env.rootfs.clone(),
        spec: minimal_spec(&env.rootfs)?,
        ..Default::default()
    };
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let failed = match env.runtime.create(&ctx, config) {
        Err(err) => err,
        Ok(_) => bail!("expected an engine failure"),
    };
    assert!(matches!(failed.error, Error::Engine(_)));

    // the partial container carries the id needed for cleanup
    let id = failed
        .container_id()
        .context("partial container missing from failed create")?
        .to_string();
    if let Some(mut partial) = failed.container {
        partial.release()?;
    }
    env.runtime.delete(&ctx, &id, true)?;
    assert!(!env.runtime.root.join("c1").exists());
    Ok(())
}
