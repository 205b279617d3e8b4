//! Lifecycle hook scripts.
//!
//! Operators can attach shell commands to pool events (`attached_process`,
//! `detached_process`, `spawn_failed`, `oob_work`). Hooks receive their
//! event context as environment variables and run outside the pool lock.
//! A failing hook is logged and otherwise ignored unless declared mandatory.

use crate::config::HookScript;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

const HOOK_ENV_PREFIX: &str = "CORRAL_";

/// Immutable registry of configured hook scripts.
#[derive(Debug, Default, Clone)]
pub struct HookRegistry {
    scripts: HashMap<String, HookScript>,
}

impl HookRegistry {
    pub fn new(scripts: HashMap<String, HookScript>) -> Self {
        Self { scripts }
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    /// Run the hook registered under `name`, if any, passing `fields` as
    /// `CORRAL_*` environment variables.
    ///
    /// Returns `Ok(())` when no hook is configured or the hook exits zero.
    /// A non-zero exit is logged and swallowed unless the hook is mandatory.
    pub fn run(&self, name: &str, fields: &[(&str, String)]) -> Result<()> {
        let Some(script) = self.scripts.get(name) else {
            return Ok(());
        };

        debug!(hook = name, command = %script.command, "Running hook script");

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&script.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env(format!("{}HOOK_NAME", HOOK_ENV_PREFIX), name);
        for (key, value) in fields {
            cmd.env(format!("{}{}", HOOK_ENV_PREFIX, key.to_uppercase()), value);
        }

        let status = cmd
            .status()
            .with_context(|| format!("failed to execute hook script '{}'", name))?;

        if status.success() {
            return Ok(());
        }

        if script.mandatory {
            anyhow::bail!("mandatory hook script '{}' exited with {}", name, status);
        }
        warn!(hook = name, %status, "Hook script failed; continuing");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(name: &str, command: &str, mandatory: bool) -> HookRegistry {
        let mut scripts = HashMap::new();
        scripts.insert(
            name.to_string(),
            HookScript {
                command: command.to_string(),
                mandatory,
            },
        );
        HookRegistry::new(scripts)
    }

    #[test]
    fn test_unconfigured_hook_is_ok() {
        let registry = HookRegistry::default();
        assert!(registry.run("attached_process", &[]).is_ok());
        assert!(!registry.is_configured("attached_process"));
    }

    #[test]
    fn test_hook_receives_fields_as_env() {
        let registry = registry_with(
            "attached_process",
            r#"test "$CORRAL_GUPID" = "abc-1" && test "$CORRAL_HOOK_NAME" = "attached_process""#,
            true,
        );
        registry
            .run("attached_process", &[("gupid", "abc-1".to_string())])
            .unwrap();
    }

    #[test]
    fn test_non_mandatory_failure_is_swallowed() {
        let registry = registry_with("spawn_failed", "exit 3", false);
        assert!(registry.run("spawn_failed", &[]).is_ok());
    }

    #[test]
    fn test_mandatory_failure_is_an_error() {
        let registry = registry_with("spawn_failed", "exit 3", true);
        let err = registry.run("spawn_failed", &[]).unwrap_err();
        assert!(err.to_string().contains("mandatory"));
    }
}
