//! Container launch assembly.
//!
//! A container-backed instance is a stdio channel whose child happens to be
//! the container runtime: this module rewrites the template's command into a
//! `docker run --rm -i …` argv with mounts, network, and resource caps
//! derived from the container descriptor and the sandbox policy. Everything
//! after the spawn (framing, correlation, teardown) is the stdio adapter's.

use crate::config::schema::{NetworkPolicy, ServiceTemplate};
use crate::error::{GatewayError, Result};
use crate::transport::sandbox::SandboxPolicy;
use crate::transport::stdio::LaunchSpec;

/// Builds the container-runtime launch recipe for a container template.
///
/// Gates applied: the inner command line is validated, volume mounts must
/// stay under the policy's volume roots, and the runtime binary itself must
/// resolve inside an allowed executable root.
///
/// # Errors
///
/// Returns the first failing gate, or `Validation` when the template has no
/// container descriptor.
pub fn build_container_launch(
    template: &ServiceTemplate,
    policy: &SandboxPolicy,
) -> Result<LaunchSpec> {
    let container = template.container.as_ref().ok_or_else(|| {
        GatewayError::Validation("container template has no container descriptor".into())
    })?;
    let command = template
        .command
        .as_deref()
        .ok_or_else(|| GatewayError::Validation("container template has no command".into()))?;

    policy.validate_command(command, &template.args)?;
    policy.validate_volumes(&container.volumes)?;
    let runtime = policy.resolve_executable(&policy.container_runtime)?;

    let mut args: Vec<String> =
        vec!["run".into(), "--rm".into(), "--interactive".into(), "--init".into()];

    match container.network {
        NetworkPolicy::Inherit | NetworkPolicy::Full => {}
        NetworkPolicy::Blocked => {
            args.push("--network".into());
            args.push("none".into());
        }
        NetworkPolicy::LocalOnly => {
            args.push("--network".into());
            args.push("host".into());
        }
    }

    if container.readonly_rootfs {
        args.push("--read-only".into());
    }
    if let Some(mb) = container.memory_limit_mb {
        args.push("--memory".into());
        args.push(format!("{mb}m"));
    }
    if let Some(cpus) = container.cpu_limit {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }

    for volume in &container.volumes {
        let mut mount = format!(
            "{}:{}",
            volume.host_path.display(),
            volume.container_path
        );
        if volume.read_only {
            mount.push_str(":ro");
        }
        args.push("--volume".into());
        args.push(mount);
    }

    // Env vars are forwarded by name; values travel through the runtime
    // client's environment, never through argv.
    for key in template.env.keys() {
        if key == "PATH" {
            continue;
        }
        args.push("--env".into());
        args.push(key.clone());
    }

    args.push(container.image.clone());
    args.push(command.to_string());
    args.extend(template.args.iter().cloned());

    let mut env = template.env.clone();
    env.remove("PATH");

    Ok(LaunchSpec {
        program: runtime,
        args,
        env,
        working_dir: template.working_dir.clone(),
    })
}
