//! Shell Context Tests
//!
//! Scoping rules of root contexts and sub-shells: working directory, PWD and
//! OLDPWD, environment and variable inheritance, shared streams and
//! constant resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use psh_core::config::{
    PIPELINE_CHANNEL_BUFFER_SIZE, PIPELINE_RW_PACKET_SIZE, SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE,
};
use psh_core::{
    Command, Pipeline, ShellConstants, ShellContext, ShellError, ShellOptions, ShellRuntime,
    StoreResult, StreamTarget, SubShellOptions,
};
use tempfile::TempDir;

fn canonical(dir: &TempDir) -> PathBuf {
    dir.path().canonicalize().expect("canonical temp dir")
}

fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Root context in `dir` with stdout and stderr discarded.
fn quiet_root(dir: &Path) -> ShellContext {
    ShellRuntime::new()
        .root_context(
            ShellOptions::new()
                .dir(dir)
                .stdout(StreamTarget::Discard)
                .stderr(StreamTarget::Discard),
        )
        .expect("root context")
}

/// Run `sh -c script` in `ctx` and return what it printed.
async fn sh_output(ctx: &ShellContext, script: &str) -> String {
    let store = StoreResult::new();
    let report = ctx
        .pipeline(
            Pipeline::new()
                .process(Command::new("sh").args(["-c", script]))
                .store(&store),
        )
        .await
        .expect("pipeline runs");
    assert!(report.success(), "script failed: {report:?}");
    store.text()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ls_runs_in_context_directory() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    std::fs::write(root.join("alpha.txt"), "").unwrap();
    std::fs::write(root.join("beta.txt"), "").unwrap();

    let out = StoreResult::new();
    let outcome = ShellRuntime::new()
        .run(
            ShellOptions::new()
                .dir(&root)
                .stdout(StreamTarget::Capture(out.clone())),
            |ctx| Box::pin(async move { ctx.run(Command::new("ls")).await }),
        )
        .await
        .unwrap();

    assert_eq!(outcome.value, 0);
    assert_eq!(out.lines(), ["alpha.txt", "beta.txt"]);
    assert_eq!(outcome.pwd, root);
    assert_eq!(outcome.env("PWD"), Some(root.to_str().unwrap()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_sees_pwd_of_its_context() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    std::fs::create_dir(root.join("inner")).unwrap();
    let ctx = quiet_root(&root);

    assert_eq!(sh_output(&ctx, "pwd").await, format!("{}\n", root.display()));
    let sub = ctx.sub_shell(SubShellOptions::new().dir("inner")).unwrap();
    assert_eq!(sub.cwd(), root.join("inner"));
    assert_eq!(
        sh_output(&sub, "printf %s \"$PWD\"").await,
        root.join("inner").display().to_string()
    );
}

#[tokio::test]
async fn test_cd_updates_pwd_and_oldpwd() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    std::fs::create_dir(root.join("a")).unwrap();
    let mut ctx = quiet_root(&root);

    ctx.cd("a").unwrap();
    assert_eq!(ctx.cwd(), root.join("a"));
    assert_eq!(ctx.env("PWD"), Some(root.join("a").to_str().unwrap()));
    assert_eq!(ctx.env("OLDPWD"), Some(root.to_str().unwrap()));

    ctx.cd("..").unwrap();
    assert_eq!(ctx.cwd(), root);
    assert_eq!(ctx.env("OLDPWD"), Some(root.join("a").to_str().unwrap()));
}

#[tokio::test]
async fn test_cd_to_same_directory_still_records_oldpwd() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    std::fs::create_dir(root.join("a")).unwrap();
    let mut ctx = quiet_root(&root);

    ctx.cd("a").unwrap();
    ctx.cd(".").unwrap();
    assert_eq!(ctx.cwd(), root.join("a"));
    assert_eq!(ctx.env("OLDPWD"), ctx.env("PWD"));
    assert_eq!(ctx.env("OLDPWD"), Some(root.join("a").to_str().unwrap()));
}

#[tokio::test]
async fn test_cd_rejects_non_directories() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    std::fs::write(root.join("file.txt"), "x").unwrap();
    let mut ctx = quiet_root(&root);

    assert!(ctx.cd("file.txt").unwrap_err().is_not_a_directory());
    assert!(ctx.cd("missing").unwrap_err().is_not_a_directory());
    assert_eq!(ctx.cwd(), root);
    assert_eq!(ctx.env("PWD"), Some(root.to_str().unwrap()));
}

#[tokio::test]
async fn test_sub_shell_inherits_environment_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = quiet_root(&canonical(&dir));
    ctx.export("PSH_TEST_INHERITED", "yes");

    let sub = ctx.sub_shell(SubShellOptions::new()).unwrap();
    assert_eq!(sub.env("PSH_TEST_INHERITED"), Some("yes"));
    assert_eq!(sub.depth(), 1);
    assert_eq!(sub.cwd(), ctx.cwd());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sub_shell_env_override_replaces_environment() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    let mut ctx = quiet_root(&root);
    ctx.export("PSH_TEST_PARENT_ONLY", "parent");

    let sub = ctx
        .sub_shell(SubShellOptions::new().env(vars(&[("PSH_TEST_CHILD", "child")])))
        .unwrap();
    assert_eq!(sub.env("PSH_TEST_PARENT_ONLY"), None);
    assert_eq!(sub.env("PSH_TEST_CHILD"), Some("child"));
    assert_eq!(sub.env("PWD"), Some(root.to_str().unwrap()));
    assert_eq!(sub.env("OLDPWD"), None);

    assert_eq!(
        sh_output(&sub, "printf '%s:%s' \"$PSH_TEST_CHILD\" \"$PSH_TEST_PARENT_ONLY\"").await,
        "child:"
    );
    // Parent untouched.
    assert_eq!(ctx.env("PSH_TEST_CHILD"), None);
}

#[tokio::test]
async fn test_sub_shell_variables_are_not_inherited() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = quiet_root(&canonical(&dir));
    ctx.set_variable("local", "1");

    let sub = ctx.sub_shell(SubShellOptions::new()).unwrap();
    assert!(sub.variables().is_empty());
    assert_eq!(sub.variable("local"), None);

    let with_vars = ctx
        .sub_shell(SubShellOptions::new().vars(vars(&[("given", "2")])))
        .unwrap();
    assert_eq!(with_vars.variables(), &vars(&[("given", "2")]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_export_is_visible_to_processes_and_sub_shells() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = quiet_root(&canonical(&dir));
    ctx.export("PSH_TEST_EXPORTED", "value");
    ctx.set_variable("PSH_TEST_LOCAL", "hidden");

    assert_eq!(ctx.env("PSH_TEST_EXPORTED"), Some("value"));
    assert_eq!(ctx.variable("PSH_TEST_EXPORTED"), Some("value"));
    assert_eq!(ctx.lookup("PSH_TEST_LOCAL"), Some("hidden"));
    assert_eq!(
        sh_output(&ctx, "printf '[%s][%s]' \"$PSH_TEST_EXPORTED\" \"$PSH_TEST_LOCAL\"").await,
        "[value][]"
    );

    let nested = ctx
        .sub_shell(SubShellOptions::new())
        .and_then(|sub| sub.sub_shell(SubShellOptions::new()))
        .unwrap();
    assert_eq!(nested.depth(), 2);
    assert_eq!(sh_output(&nested, "printf %s \"$PSH_TEST_EXPORTED\"").await, "value");
}

#[tokio::test]
async fn test_unset_protects_pwd() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    let mut ctx = quiet_root(&root);
    ctx.export("PSH_TEST_GONE", "x");

    assert!(ctx.unset("PSH_TEST_GONE"));
    assert_eq!(ctx.lookup("PSH_TEST_GONE"), None);
    assert!(!ctx.unset("PWD"));
    assert_eq!(ctx.env("PWD"), Some(root.to_str().unwrap()));

    ctx.export("PWD", "/elsewhere");
    assert_eq!(ctx.env("PWD"), Some(root.to_str().unwrap()));
}

#[tokio::test]
async fn test_sub_shell_shares_parent_streams() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = quiet_root(&canonical(&dir));
    let sub = ctx.sub_shell(SubShellOptions::new()).unwrap();

    assert_eq!(sub.stdout(), ctx.stdout());
    assert_eq!(sub.stderr(), ctx.stderr());
    assert_ne!(ctx.stdout(), ctx.stderr());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sub_shell_output_reaches_parent_stdout_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let out = StoreResult::new();
    ShellRuntime::new()
        .run(
            ShellOptions::new()
                .dir(canonical(&dir))
                .stdout(StreamTarget::Capture(out.clone())),
            |ctx| {
                Box::pin(async move {
                    ctx.run(Command::new("printf").arg("parent\n")).await?;
                    ctx.with_sub_shell(SubShellOptions::new(), |sub| {
                        Box::pin(async move { sub.run(Command::new("printf").arg("child\n")).await })
                    })
                    .await?;
                    ctx.run(Command::new("printf").arg("parent again\n")).await
                })
            },
        )
        .await
        .unwrap();

    assert_eq!(out.text(), "parent\nchild\nparent again\n");
}

#[tokio::test]
async fn test_redirect_affects_only_that_context() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = quiet_root(&canonical(&dir));
    let mut sub = ctx.sub_shell(SubShellOptions::new()).unwrap();

    let private = psh_core::Channel::new(4, 16);
    let previous = sub.redirect_stdout(private.clone());
    assert_eq!(&previous, ctx.stdout());
    assert_eq!(sub.stdout(), &private);
    assert_ne!(ctx.stdout(), &private);
}

#[tokio::test]
async fn test_invalid_directory_is_rejected_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(&dir);
    let file = root.join("not-a-dir");
    std::fs::write(&file, "x").unwrap();

    let err = ShellRuntime::new()
        .root_context(ShellOptions::new().dir(&file))
        .unwrap_err();
    assert!(matches!(err, ShellError::NotADirectory(ref path) if *path == file));

    let ctx = quiet_root(&root);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let marker = root.join("marker");
    let err = ctx
        .with_sub_shell(SubShellOptions::new().dir("missing"), move |sub| {
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                sub.run(Command::new("touch").arg("marker")).await
            })
        })
        .await
        .unwrap_err();

    assert!(err.is_not_a_directory());
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_constants_default_and_are_written_back() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ShellRuntime::new()
        .root_context(
            ShellOptions::new()
                .dir(canonical(&dir))
                .env(HashMap::new())
                .stdout(StreamTarget::Discard)
                .stderr(StreamTarget::Discard),
        )
        .unwrap();

    assert_eq!(ctx.constants(), &ShellConstants::default());
    assert_eq!(ctx.env(SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE), Some("8"));
    assert_eq!(ctx.env(PIPELINE_CHANNEL_BUFFER_SIZE), Some("64"));
    assert_eq!(ctx.env(PIPELINE_RW_PACKET_SIZE), Some("4096"));
    assert_eq!(ctx.stdout().capacity(), 64);
    assert_eq!(ctx.stdout().chunk_size(), 4096);
}

#[tokio::test]
async fn test_constants_come_from_environment() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ShellRuntime::new()
        .root_context(
            ShellOptions::new()
                .dir(canonical(&dir))
                .env(vars(&[
                    (SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE, "3"),
                    (PIPELINE_CHANNEL_BUFFER_SIZE, "5"),
                    (PIPELINE_RW_PACKET_SIZE, "7"),
                ]))
                .stdout(StreamTarget::Discard)
                .stderr(StreamTarget::Discard),
        )
        .unwrap();
    assert_eq!(
        ctx.constants(),
        &ShellConstants {
            input_stream_buffer_size: 3,
            channel_buffer_size: 5,
            rw_packet_size: 7,
        }
    );

    // Re-resolved from the sub-shell's own environment.
    let sub = ctx
        .sub_shell(SubShellOptions::new().env(vars(&[(PIPELINE_RW_PACKET_SIZE, "11")])))
        .unwrap();
    assert_eq!(sub.constants().rw_packet_size, 11);
    assert_eq!(sub.constants().channel_buffer_size, 64);
    assert_eq!(ctx.sub_shell(SubShellOptions::new()).unwrap().constants(), ctx.constants());
}

#[tokio::test]
async fn test_unusable_constant_fails_context_creation() {
    let dir = tempfile::tempdir().unwrap();
    let err = ShellRuntime::new()
        .root_context(
            ShellOptions::new()
                .dir(canonical(&dir))
                .env(vars(&[(PIPELINE_CHANNEL_BUFFER_SIZE, "0")])),
        )
        .unwrap_err();
    assert!(matches!(err, ShellError::InvalidConfig { ref key, .. } if key == PIPELINE_CHANNEL_BUFFER_SIZE));
}
