//! Tests for container construction and the launch helpers.

use koker::container::{self, Container, RunOptions};
use koker::image::ImageConfig;
use nix::unistd::geteuid;

// =============================================================================
// Id Validation
// =============================================================================

#[test]
fn short_ids_are_rejected() {
    for id in ["", "abc", "0123456789a"] {
        let err = Container::new(id).unwrap_err();
        assert!(
            err.to_string().contains("invalid container id"),
            "id {:?} must be rejected before any resource is touched",
            id
        );
    }
}

#[test]
fn generated_ids_pass_validation() {
    if !geteuid().is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }
    let id = koker::utils::gen_container_id();
    let container = match Container::new(&id) {
        Ok(c) => c,
        Err(koker::Error::Cgroup { reason }) => {
            eprintln!("skipping: cgroup hierarchy not writable ({})", reason);
            return;
        }
        Err(e) => panic!("unexpected error: {}", e),
    };
    assert!(container.rootfs.ends_with("mnt"));
    container.delete().unwrap();
}

// =============================================================================
// Launch Helpers
// =============================================================================

#[test]
fn child_argv_matches_the_reexec_contract() {
    let opts = RunOptions {
        hostname: "box".into(),
        memory_mb: 128,
        swap_mb: 64,
        pids: 100,
        cpus: 1.5,
        quiet: false,
        debug: false,
    };
    let args = container::child_args(
        "0123456789abcdef01234567",
        &["ping".into(), "-c1".into(), "172.69.0.1".into()],
        &opts,
    );
    assert_eq!(
        args,
        vec![
            "container",
            "child",
            "--mem=128",
            "--pids=100",
            "--cpus=1.5",
            "--hostname=box",
            "0123456789abcdef01234567",
            "ping",
            "-c1",
            "172.69.0.1"
        ]
    );
}

#[test]
fn entrypoint_is_prepended_unconditionally() {
    let config = ImageConfig {
        entrypoint: vec!["/docker-entrypoint.sh".into()],
        cmd: vec!["nginx".into(), "-g".into(), "daemon off;".into()],
        ..Default::default()
    };

    let defaulted = container::build_command_line(&config, &[]);
    assert_eq!(defaulted[0], "/docker-entrypoint.sh");
    assert_eq!(&defaulted[1..], ["nginx", "-g", "daemon off;"]);

    let overridden = container::build_command_line(&config, &["sh".into()]);
    assert_eq!(overridden, vec!["/docker-entrypoint.sh", "sh"]);
}

#[test]
fn no_entrypoint_means_plain_command() {
    let config = ImageConfig::default();
    let argv = container::build_command_line(&config, &["echo".into(), "hello".into()]);
    assert_eq!(argv, vec!["echo", "hello"]);
}

#[test]
fn empty_config_and_no_args_yields_no_command() {
    let config = ImageConfig::default();
    assert!(container::build_command_line(&config, &[]).is_empty());
}

#[test]
fn default_hostname_is_twelve_characters() {
    let id = "fedcba9876543210fedcba98";
    let hostname = container::default_hostname(id);
    assert_eq!(hostname.len(), 12);
    assert!(id.starts_with(hostname));
}
