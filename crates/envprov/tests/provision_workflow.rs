//! End-to-end provisioning runs against the in-memory conda fake.

use envprov::fakes::FakeConda;
use envprov::{
    BuildMatrix, InterpreterVersion, MatrixJob, ProvisionConfig, ProvisionState, Provisioner,
    StepStatus,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

const LEGACY: &str = "Miniconda2-latest-Linux-x86_64.sh";
const CURRENT: &str = "Miniconda3-latest-Linux-x86_64.sh";
const SCRIPT: &[u8] = b"#!/bin/bash\necho installing\n";

/// Local installer mirror plus a config pointing at it.
fn setup() -> (TempDir, ProvisionConfig) {
    let dir = tempdir().expect("tempdir");
    let mirror = dir.path().join("mirror");
    std::fs::create_dir_all(&mirror).unwrap();
    std::fs::write(mirror.join(LEGACY), SCRIPT).unwrap();
    std::fs::write(mirror.join(CURRENT), SCRIPT).unwrap();

    let mut config = ProvisionConfig::default().with_prefix(dir.path().join("miniconda"));
    config.download_dir = dir.path().join("downloads");
    config.installer.legacy_url = format!("file://{}", mirror.join(LEGACY).display());
    config.installer.current_url = format!("file://{}", mirror.join(CURRENT).display());
    (dir, config)
}

async fn run(config: ProvisionConfig, fake: &Arc<FakeConda>, python: &str) -> envprov::ProvisionReport {
    let spec = config
        .environment_spec(python.parse().expect("version"))
        .expect("spec");
    Provisioner::run(Arc::new(config), fake.clone(), &spec, None).await
}

fn installer_arg(fake: &FakeConda) -> String {
    let call = fake
        .calls()
        .into_iter()
        .find(|c| c.step == "install_base")
        .expect("install_base invoked");
    call.args[0].clone()
}

/// Test: legacy interpreter provisions end to end with the legacy installer
#[tokio::test]
async fn test_legacy_interpreter_full_run() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());

    let report = run(config, &fake, "2.7").await;

    assert!(report.success(), "run should succeed: {:?}", report.error);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.final_state, ProvisionState::End);
    assert_eq!(report.installer.as_ref().unwrap().kind.name(), "miniconda2");
    assert!(installer_arg(&fake).ends_with(LEGACY));

    assert_eq!(
        fake.steps(),
        vec![
            "install_base",
            "diagnostics",
            "create_environment",
            "install_openbabel",
            "install_rdkit",
            "prune_caches",
            "inventory",
            "test",
        ]
    );
}

/// Test: 3.x interpreters use the current installer
#[tokio::test]
async fn test_current_interpreter_uses_current_installer() {
    for python in ["3.6", "3.7"] {
        let (_dir, config) = setup();
        let fake = Arc::new(FakeConda::new());

        let report = run(config, &fake, python).await;

        assert!(report.success());
        assert_eq!(report.installer.as_ref().unwrap().kind.name(), "miniconda3");
        assert!(installer_arg(&fake).ends_with(CURRENT));

        let create = fake
            .calls()
            .into_iter()
            .find(|c| c.step == "create_environment")
            .unwrap();
        assert!(create.args.contains(&format!("python={}", python)));
    }
}

/// Test: final environment holds base packages then additional ones, in order
#[tokio::test]
async fn test_package_set_is_union_in_order() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());

    let report = run(config, &fake, "3.6").await;

    let env = report.environment.expect("environment recorded");
    assert_eq!(
        env.package_names(),
        vec!["numpy", "tqdm", "pytest", "openbabel", "rdkit"]
    );
    assert_eq!(env.interpreter, InterpreterVersion::new(3, 6));
    assert_eq!(
        fake.installed("test-environment").unwrap(),
        vec!["python", "numpy", "tqdm", "pytest", "openbabel", "rdkit"]
    );
}

/// Test: test command runs inside the activated environment
#[tokio::test]
async fn test_test_command_sees_active_environment() {
    let (dir, config) = setup();
    let fake = Arc::new(FakeConda::new());

    run(config, &fake, "3.6").await;

    let test = fake.calls().into_iter().find(|c| c.step == "test").unwrap();
    assert_eq!(test.program, "make");
    assert_eq!(test.args, vec!["test"]);
    assert_eq!(test.env["CONDA_DEFAULT_ENV"], "test-environment");

    let env_bin = dir.path().join("miniconda/envs/test-environment/bin");
    let base_bin = dir.path().join("miniconda/bin");
    let path: Vec<&str> = test.env["PATH"].split(':').collect();
    assert_eq!(Path::new(path[0]), env_bin);
    assert_eq!(Path::new(path[1]), base_bin);

    let condarc = std::fs::read_to_string(dir.path().join("miniconda/.condarc")).unwrap();
    assert!(condarc.contains("always_yes: true"));
    assert!(condarc.contains("changeps1: false"));
}

/// Test: a failed step aborts before the test command
#[tokio::test]
async fn test_resolution_failure_is_fail_fast() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    fake.fail_on("create_environment", 1);

    let report = run(config, &fake, "3.6").await;

    assert!(!report.success());
    assert_eq!(report.exit_code(), 1);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.step, "create_environment");
    assert_eq!(error.class, "resolution");
    assert_eq!(report.final_state, ProvisionState::ManagerConfigured);
    assert_eq!(fake.count_step("install_openbabel"), 0);
    assert_eq!(fake.count_step("test"), 0);
    assert!(report.environment.is_none());
}

/// Test: a failed create still removes whatever it left behind
#[tokio::test]
async fn test_failed_create_is_removed() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    fake.fail_on("create_environment", 1);

    let report = run(config, &fake, "2.7").await;

    assert_eq!(report.error.as_ref().unwrap().step, "create_environment");
    assert_eq!(
        fake.steps(),
        vec![
            "install_base",
            "diagnostics",
            "create_environment",
            "remove_environment",
        ]
    );
    let remove = fake
        .calls()
        .into_iter()
        .find(|c| c.step == "remove_environment")
        .unwrap();
    assert!(remove.args.ends_with(&["-n".to_string(), "test-environment".to_string()]));
    assert_eq!(report.step("rollback").unwrap().status, StepStatus::Passed);
    assert!(report.environment.is_none());
}

/// Test: failure after environment creation rolls the environment back
#[tokio::test]
async fn test_additional_install_failure_rolls_back() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    fake.fail_on("install_rdkit", 1);

    let report = run(config, &fake, "2.7").await;

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.error.as_ref().unwrap().step, "install_rdkit");
    assert_eq!(fake.count_step("prune_caches"), 0);
    assert_eq!(fake.count_step("test"), 0);
    assert_eq!(fake.count_step("remove_environment"), 1);
    assert!(!fake.env_exists("test-environment"));
    assert_eq!(report.step("rollback").unwrap().status, StepStatus::Passed);
}

/// Test: base install failure is an install error and nothing else runs
#[tokio::test]
async fn test_install_failure() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    fake.fail_on("install_base", 2);

    let report = run(config, &fake, "3.6").await;

    assert_eq!(report.error.as_ref().unwrap().class, "install");
    assert_eq!(report.step("install_base").unwrap().exit_code, Some(2));
    assert_eq!(fake.steps(), vec!["install_base"]);
}

/// Test: cache pruning failure never changes the outcome
#[tokio::test]
async fn test_prune_failure_is_non_fatal() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    fake.fail_on("prune_caches", 1);

    let report = run(config, &fake, "3.6").await;

    assert!(report.success());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.warned_count(), 1);
    assert_eq!(
        report.step("prune_caches").unwrap().status,
        StepStatus::Warned
    );
    assert_eq!(fake.count_step("test"), 1);
}

/// Test: the job exit code is the test command's exit code
#[tokio::test]
async fn test_exit_code_passes_through() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    fake.fail_on("test", 3);

    let report = run(config, &fake, "3.6").await;

    assert!(report.error.is_none());
    assert_eq!(report.test_exit_code, Some(3));
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.final_state, ProvisionState::End);
}

/// Test: a package missing from the inventory fails the run before testing
#[tokio::test]
async fn test_inventory_mismatch_fails() {
    let (_dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    fake.hide_from_inventory("rdkit");

    let report = run(config, &fake, "3.6").await;

    let error = report.error.as_ref().unwrap();
    assert_eq!(error.class, "resolution");
    assert!(error.message.contains("rdkit"));
    assert_eq!(fake.count_step("test"), 0);
    assert_eq!(fake.count_step("remove_environment"), 1);
}

/// Test: a non-script download is rejected before execution
#[tokio::test]
async fn test_integrity_rejects_non_script() {
    let (dir, mut config) = setup();
    let bogus = dir.path().join("mirror/broken.sh");
    std::fs::write(&bogus, b"<html>404</html>").unwrap();
    config.installer.current_url = format!("file://{}", bogus.display());
    let fake = Arc::new(FakeConda::new());

    let report = run(config, &fake, "3.6").await;

    assert_eq!(report.error.as_ref().unwrap().class, "integrity");
    assert_eq!(report.final_state, ProvisionState::InstallerSelected);
    assert!(fake.calls().is_empty());
}

/// Test: a pinned checksum must match
#[tokio::test]
async fn test_pinned_checksum() {
    let (_dir, mut config) = setup();
    let digest = hex::encode(Sha256::digest(SCRIPT));

    config.installer.current_sha256 = Some(digest.to_uppercase());
    let fake = Arc::new(FakeConda::new());
    assert!(run(config.clone(), &fake, "3.6").await.success());

    config.installer.current_sha256 = Some("00".repeat(32));
    let fake = Arc::new(FakeConda::new());
    let report = run(config, &fake, "3.6").await;
    assert_eq!(report.error.as_ref().unwrap().class, "integrity");
}

/// Test: unreachable installer is a network error
#[tokio::test]
async fn test_missing_installer_is_network_error() {
    let (dir, mut config) = setup();
    config.installer.legacy_url = format!("file://{}", dir.path().join("nope.sh").display());
    let fake = Arc::new(FakeConda::new());

    let report = run(config, &fake, "2.7").await;

    assert_eq!(report.error.as_ref().unwrap().class, "network");
    assert!(fake.calls().is_empty());
}

/// Test: pre-commands run first and abort the run on failure
#[tokio::test]
async fn test_pre_commands() {
    let (_dir, mut config) = setup();
    config.pre_commands = vec![vec![
        "sudo".to_string(),
        "apt-get".to_string(),
        "update".to_string(),
    ]];

    let fake = Arc::new(FakeConda::new());
    let report = run(config.clone(), &fake, "3.6").await;
    assert!(report.success());
    assert_eq!(fake.steps()[0], "pre_command_0");

    let fake = Arc::new(FakeConda::new());
    fake.fail_on("pre_command_0", 100);
    let report = run(config, &fake, "3.6").await;
    assert_eq!(report.error.as_ref().unwrap().class, "step_failed");
    assert_eq!(report.final_state, ProvisionState::Start);
    assert_eq!(fake.steps(), vec!["pre_command_0"]);
}

/// Test: matrix jobs run in isolated prefixes and report independently
#[tokio::test]
async fn test_matrix_runs_each_job() {
    let (dir, config) = setup();
    let fake = Arc::new(FakeConda::new());
    let matrix = BuildMatrix::new(vec![
        MatrixJob::new("py27", InterpreterVersion::new(2, 7)),
        MatrixJob::new("py36", InterpreterVersion::new(3, 6)),
    ])
    .unwrap();

    let root = dir.path().join("jobs");
    let report = matrix.run(&config, fake.clone(), &root).await.unwrap();

    assert!(report.success());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.jobs.len(), 2);
    assert_eq!(
        report.job("py27").unwrap().installer.as_ref().unwrap().kind.name(),
        "miniconda2"
    );
    assert_eq!(
        report.job("py36").unwrap().installer.as_ref().unwrap().kind.name(),
        "miniconda3"
    );

    let prefixes: Vec<String> = fake
        .calls()
        .into_iter()
        .filter(|c| c.step == "install_base")
        .map(|c| c.args.last().unwrap().clone())
        .collect();
    assert_eq!(
        prefixes,
        vec![
            root.join("py27/miniconda").to_string_lossy().into_owned(),
            root.join("py36/miniconda").to_string_lossy().into_owned(),
        ]
    );
}

/// Test: legacy and current interpreters end with the same environment and steps
#[tokio::test]
async fn test_installer_choice_does_not_change_outcome() {
    // Calls with the scratch root and interpreter-specific arguments removed.
    fn normalized(fake: &FakeConda, root: &Path) -> Vec<(String, String, Vec<String>)> {
        let root = root.to_string_lossy().into_owned();
        fake.calls()
            .into_iter()
            .map(|c| {
                let program = c.program_name().to_string();
                let args = c
                    .args
                    .iter()
                    .filter(|a| !a.starts_with("python=") && !a.ends_with(".sh"))
                    .map(|a| a.replace(&root, "<root>"))
                    .collect();
                (c.step, program, args)
            })
            .collect()
    }

    fn without_python(fake: &FakeConda) -> Vec<String> {
        fake.installed("test-environment")
            .unwrap()
            .into_iter()
            .filter(|p| p != "python")
            .collect()
    }

    let (legacy_dir, legacy_config) = setup();
    let legacy_fake = Arc::new(FakeConda::new());
    let legacy = run(legacy_config, &legacy_fake, "2.7").await;

    let (current_dir, current_config) = setup();
    let current_fake = Arc::new(FakeConda::new());
    let current = run(current_config, &current_fake, "3.6").await;

    assert!(legacy.success() && current.success());
    assert_eq!(legacy.installer.as_ref().unwrap().kind.name(), "miniconda2");
    assert_eq!(current.installer.as_ref().unwrap().kind.name(), "miniconda3");

    let legacy_env = legacy.environment.as_ref().unwrap();
    let current_env = current.environment.as_ref().unwrap();
    assert_eq!(legacy_env.package_names(), current_env.package_names());
    assert_eq!(legacy_env.packages, current_env.packages);

    assert_eq!(without_python(&legacy_fake), without_python(&current_fake));

    assert_eq!(legacy_fake.steps(), current_fake.steps());
    assert_eq!(
        normalized(&legacy_fake, legacy_dir.path()),
        normalized(&current_fake, current_dir.path())
    );
    assert_eq!(legacy_fake.count_step("test"), 1);
    assert_eq!(current_fake.count_step("test"), 1);
}
