//! Sandbox enforcement applied before any stdio or container launch.
//!
//! Three gates run before a child process exists: the executable must
//! resolve inside a fixed allow-list of roots (symlinks included), the
//! command line must pass validation (length, arg count, control and shell
//! characters, banned fragments), and container volumes must stay inside
//! the policy's volume roots. A fourth rule rewrites untrusted stdio
//! templates to container transport when the policy demands isolation.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use tracing::debug;

use crate::config::schema::{
    ContainerSpec, NetworkPolicy, SandboxConfig, SecuritySpec, ServiceTemplate, TrustLevel,
    VolumeMount,
};
use crate::error::{GatewayError, Result};
use crate::transport::TransportKind;

/// Maximum serialized command-line length in bytes.
const MAX_COMMAND_BYTES: usize = 4096;

/// Maximum argument count.
const MAX_ARGS: usize = 64;

/// Shell metacharacters rejected unless the policy allows them.
const SHELL_METACHARACTERS: &[char] =
    &[';', '&', '|', '`', '$', '<', '>', '(', ')', '{', '}', '*', '?', '~', '!', '\\', '\'', '"'];

/// Commands and fragments that are never launched, regardless of policy.
const BANNED_COMMANDS: &[&str] = &["dd", "mkfs", "shutdown", "reboot", "halt", "poweroff", "init"];
const BANNED_FRAGMENTS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "--no-preserve-root",
    "mkfs.",
    ":(){ :|:& };:",
    "> /dev/sda",
];

/// The PATH directories captured once at process start.
///
/// Template-supplied PATH values never influence executable resolution.
fn startup_path_dirs() -> &'static [PathBuf] {
    static DIRS: OnceLock<Vec<PathBuf>> = OnceLock::new();
    DIRS.get_or_init(|| {
        std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).collect())
            .unwrap_or_default()
    })
}

/// Effective sandbox policy, derived from [`SandboxConfig`] plus ambient
/// facts captured at process start.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    exec_roots: Vec<PathBuf>,
    volume_roots: Vec<PathBuf>,
    /// Container runtime binary, e.g. `docker` or `podman`.
    pub container_runtime: String,
    /// Rewrite non-trusted stdio templates to container transport.
    pub require_container_for_untrusted: bool,
    allow_shell_metacharacters: bool,
}

impl SandboxPolicy {
    /// Builds the effective policy: startup PATH + the gateway's own install
    /// directory + the project's `node_modules/.bin` + `TOOLGATE_SANDBOX_ROOT`
    /// + configured extras.
    #[must_use]
    pub fn from_config(config: &SandboxConfig) -> Self {
        let mut exec_roots: Vec<PathBuf> = startup_path_dirs().to_vec();
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                exec_roots.push(dir.to_path_buf());
            }
        }
        if let Ok(cwd) = std::env::current_dir() {
            exec_roots.push(cwd.join("node_modules/.bin"));
        }
        if let Some(root) = std::env::var_os("TOOLGATE_SANDBOX_ROOT") {
            exec_roots.push(PathBuf::from(root));
        }
        exec_roots.extend(config.allowed_exec_roots.iter().cloned());
        // Only keep roots that exist so canonicalize() cannot be tricked
        // through a not-yet-created directory.
        let exec_roots: Vec<PathBuf> =
            exec_roots.into_iter().filter_map(|p| p.canonicalize().ok()).collect();
        let volume_roots: Vec<PathBuf> = config
            .allowed_volume_roots
            .iter()
            .filter_map(|p| p.canonicalize().ok())
            .collect();

        Self {
            exec_roots,
            volume_roots,
            container_runtime: config.container_runtime.clone(),
            require_container_for_untrusted: config.require_container_for_untrusted,
            allow_shell_metacharacters: config.allow_shell_metacharacters,
        }
    }

    /// Resolves `command` to an absolute executable path inside an allowed
    /// root.
    ///
    /// Bare names are searched across the allowed roots; paths are taken as
    /// given. Either way the final `realpath` must sit inside an allowed
    /// root, so a symlink pointing outside the allow-list refuses to launch.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when no allowed candidate exists.
    pub fn resolve_executable(&self, command: &str) -> Result<PathBuf> {
        let candidates: Vec<PathBuf> = if command.contains(std::path::MAIN_SEPARATOR) {
            vec![PathBuf::from(command)]
        } else {
            self.exec_roots.iter().map(|root| root.join(command)).collect()
        };

        for candidate in candidates {
            let Ok(real) = candidate.canonicalize() else {
                continue;
            };
            if !real.is_file() {
                continue;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let Ok(meta) = real.metadata() else { continue };
                if meta.permissions().mode() & 0o111 == 0 {
                    continue;
                }
            }
            if self.exec_roots.iter().any(|root| real.starts_with(root)) {
                debug!(command, resolved = %real.display(), "executable resolved");
                return Ok(real);
            }
        }

        Err(GatewayError::Forbidden(format!(
            "executable {command:?} does not resolve inside an allowed root"
        )))
    }

    /// Validates the command line before launch.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for banned commands/fragments and `Validation`
    /// for structural violations.
    pub fn validate_command(&self, command: &str, args: &[String]) -> Result<()> {
        if args.len() > MAX_ARGS {
            return Err(GatewayError::Validation(format!(
                "too many arguments: {} (limit {MAX_ARGS})",
                args.len()
            )));
        }
        let total: usize =
            command.len() + args.iter().map(|a| a.len() + 1).sum::<usize>();
        if total > MAX_COMMAND_BYTES {
            return Err(GatewayError::Validation(format!(
                "command line is {total} bytes (limit {MAX_COMMAND_BYTES})"
            )));
        }

        let basename = Path::new(command)
            .file_name()
            .map_or_else(|| command.to_string(), |n| n.to_string_lossy().into_owned());
        if BANNED_COMMANDS.contains(&basename.as_str()) {
            return Err(GatewayError::Forbidden(format!("command {basename:?} is banned")));
        }

        let joined = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let lowered = joined.to_ascii_lowercase();
        for fragment in BANNED_FRAGMENTS {
            if lowered.contains(fragment) {
                return Err(GatewayError::Forbidden(format!(
                    "command line contains banned fragment {fragment:?}"
                )));
            }
        }

        if joined.chars().any(char::is_control) {
            return Err(GatewayError::Validation(
                "command line contains control characters".into(),
            ));
        }
        if !self.allow_shell_metacharacters {
            if let Some(c) = joined.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
                return Err(GatewayError::Validation(format!(
                    "command line contains shell metacharacter {c:?}"
                )));
            }
        }
        Ok(())
    }

    /// Validates container volume mounts against the allow-list.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when a host path escapes every allowed volume
    /// root and `Validation` for malformed container paths.
    pub fn validate_volumes(&self, volumes: &[VolumeMount]) -> Result<()> {
        for volume in volumes {
            let container_path = Path::new(&volume.container_path);
            if !container_path.is_absolute() {
                return Err(GatewayError::Validation(format!(
                    "container path {:?} must be absolute",
                    volume.container_path
                )));
            }
            if container_path.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(GatewayError::Validation(format!(
                    "container path {:?} must not contain '..'",
                    volume.container_path
                )));
            }

            let real = volume.host_path.canonicalize().map_err(|e| {
                GatewayError::Validation(format!(
                    "host path {} cannot be resolved: {e}",
                    volume.host_path.display()
                ))
            })?;
            if !self.volume_roots.iter().any(|root| real.starts_with(root)) {
                return Err(GatewayError::Forbidden(format!(
                    "host path {} is outside every allowed volume root",
                    real.display()
                )));
            }
        }
        Ok(())
    }

    /// Applies the trust tier: a non-trusted stdio template is transparently
    /// rewritten to container transport when the policy (or the template's
    /// own security descriptor) requires isolation.
    #[must_use]
    pub fn apply_trust(&self, template: &ServiceTemplate) -> ServiceTemplate {
        let wants_container = template.security.as_ref().is_some_and(|s| s.require_container)
            || (self.require_container_for_untrusted && template.trust() != TrustLevel::Trusted);
        if template.transport != TransportKind::Stdio || !wants_container {
            return template.clone();
        }

        let network = template
            .security
            .as_ref()
            .map_or(NetworkPolicy::Blocked, |s| s.network);
        let image = template
            .container
            .as_ref()
            .map_or_else(
                || suggest_image(template.command.as_deref().unwrap_or_default()).to_string(),
                |c| c.image.clone(),
            );

        let mut rewritten = template.clone();
        rewritten.transport = TransportKind::Container;
        rewritten.container = Some(ContainerSpec {
            image,
            volumes: template.container.as_ref().map(|c| c.volumes.clone()).unwrap_or_default(),
            network,
            readonly_rootfs: true,
            memory_limit_mb: template.container.as_ref().and_then(|c| c.memory_limit_mb),
            cpu_limit: template.container.as_ref().and_then(|c| c.cpu_limit),
        });
        if rewritten.security.is_none() {
            rewritten.security = Some(SecuritySpec {
                trust: template.trust(),
                require_container: true,
                network,
            });
        }
        let image = rewritten.container.as_ref().map_or("", |c| c.image.as_str());
        debug!(template = %template.name, image, "stdio template rewritten to container transport");
        rewritten
    }
}

/// Builds the launch recipe for a plain stdio template, running every
/// sandbox gate on the way.
///
/// Env references must already be resolved. A template-supplied PATH is
/// dropped from the overlay so it cannot influence later lookups inside the
/// child's own process tree.
///
/// # Errors
///
/// Returns the first gate failure (`Forbidden` or `Validation`).
pub fn build_stdio_launch(
    template: &ServiceTemplate,
    policy: &SandboxPolicy,
) -> Result<crate::transport::stdio::LaunchSpec> {
    let command = template
        .command
        .as_deref()
        .ok_or_else(|| GatewayError::Validation("stdio template has no command".into()))?;
    policy.validate_command(command, &template.args)?;
    let program = policy.resolve_executable(command)?;

    let mut env = template.env.clone();
    env.remove("PATH");

    Ok(crate::transport::stdio::LaunchSpec {
        program,
        args: template.args.clone(),
        env,
        working_dir: template.working_dir.clone(),
    })
}

/// Suggests a container image for a bare command.
#[must_use]
pub fn suggest_image(command: &str) -> &'static str {
    let basename = Path::new(command)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match basename.as_str() {
        "node" | "npx" | "npm" => "node:22-slim",
        "python" | "python3" | "uv" | "uvx" | "pip" => "python:3.12-slim",
        "deno" => "denoland/deno:alpine",
        "bun" => "oven/bun:slim",
        _ => "debian:stable-slim",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> SandboxPolicy {
        SandboxPolicy::from_config(&SandboxConfig::default())
    }

    fn policy_with_volumes(root: &Path) -> SandboxPolicy {
        SandboxPolicy::from_config(&SandboxConfig {
            allowed_volume_roots: vec![root.to_path_buf()],
            ..SandboxConfig::default()
        })
    }

    #[test]
    fn resolves_path_binaries_from_startup_path() {
        let policy = policy();
        let resolved = policy.resolve_executable("cat").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("cat"));
    }

    #[test]
    fn rejects_unknown_binaries() {
        let err = policy().resolve_executable("definitely-not-a-binary-xyz").unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn rejects_paths_outside_roots() {
        // /etc/hostname exists but is not executable / not under an exec root.
        let err = policy().resolve_executable("/etc/hostname").unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn banned_command_refused() {
        let err = policy().validate_command("dd", &[]).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = policy()
            .validate_command("/sbin/mkfs", &["-t".into(), "ext4".into()])
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn banned_fragment_refused() {
        let err = policy()
            .validate_command("bash", &["-c".into(), "rm -rf /".into()])
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = policy()
            .validate_command("rm", &["--no-preserve-root".into(), "/".into()])
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn metacharacters_refused_unless_allowed() {
        let err = policy()
            .validate_command("echo", &["a;b".into()])
            .unwrap_err();
        assert_eq!(err.code(), "validation");

        let relaxed = SandboxPolicy::from_config(&SandboxConfig {
            allow_shell_metacharacters: true,
            ..SandboxConfig::default()
        });
        assert!(relaxed.validate_command("echo", &["a;b".into()]).is_ok());
    }

    #[test]
    fn control_characters_refused() {
        let err = policy()
            .validate_command("echo", &["a\u{7}b".into()])
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn oversized_command_lines_refused() {
        let args = vec!["x".repeat(5000)];
        assert!(policy().validate_command("echo", &args).is_err());

        let many: Vec<String> = (0..65).map(|i| i.to_string()).collect();
        assert!(policy().validate_command("echo", &many).is_err());
    }

    #[test]
    fn volumes_must_stay_under_roots() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("data");
        std::fs::create_dir(&inside).unwrap();

        let policy = policy_with_volumes(dir.path());
        let ok = VolumeMount {
            host_path: inside,
            container_path: "/data".into(),
            read_only: true,
        };
        assert!(policy.validate_volumes(std::slice::from_ref(&ok)).is_ok());

        let escape = VolumeMount {
            host_path: PathBuf::from("/etc"),
            container_path: "/etc".into(),
            read_only: true,
        };
        assert_eq!(
            policy.validate_volumes(&[escape]).unwrap_err().code(),
            "forbidden"
        );

        let dotdot = VolumeMount {
            host_path: ok.host_path.clone(),
            container_path: "/data/../escape".into(),
            read_only: false,
        };
        assert_eq!(
            policy.validate_volumes(&[dotdot]).unwrap_err().code(),
            "validation"
        );
    }

    #[test]
    fn trust_rewrite_targets_untrusted_stdio() {
        let config = SandboxConfig {
            require_container_for_untrusted: true,
            ..SandboxConfig::default()
        };
        let policy = SandboxPolicy::from_config(&config);

        let template: ServiceTemplate = serde_json::from_value(json!({
            "name": "vendor",
            "transport": "stdio",
            "command": "npx",
            "args": ["-y", "some-tool"],
            "security": {"trust": "untrusted"},
        }))
        .unwrap();

        let rewritten = policy.apply_trust(&template);
        assert_eq!(rewritten.transport, TransportKind::Container);
        let container = rewritten.container.unwrap();
        assert_eq!(container.image, "node:22-slim");
        assert_eq!(container.network, NetworkPolicy::Blocked);
        assert!(container.readonly_rootfs);
    }

    #[test]
    fn trusted_templates_are_untouched() {
        let config = SandboxConfig {
            require_container_for_untrusted: true,
            ..SandboxConfig::default()
        };
        let policy = SandboxPolicy::from_config(&config);
        let template: ServiceTemplate = serde_json::from_value(json!({
            "name": "local",
            "transport": "stdio",
            "command": "cat",
        }))
        .unwrap();
        let untouched = policy.apply_trust(&template);
        assert_eq!(untouched.transport, TransportKind::Stdio);
        assert!(untouched.container.is_none());
    }

    #[test]
    fn image_suggestions() {
        assert_eq!(suggest_image("node"), "node:22-slim");
        assert_eq!(suggest_image("/usr/bin/python3"), "python:3.12-slim");
        assert_eq!(suggest_image("weird-binary"), "debian:stable-slim");
    }
}
