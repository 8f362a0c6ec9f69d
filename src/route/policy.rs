//! Policy routing setup
//!
//! TPROXY needs marked packets looped back to the local stack: one
//! `ip rule` per address family and listener mark pointing at a dedicated
//! routing table whose only route sends everything to the loopback device.
//! Installed through the `ip` binary, mirroring what an operator would
//! type by hand.

use tokio::process::Command;
use tracing::{debug, warn};

use super::error::RouteError;

/// Installs and removes the `ip rule` / `ip route` pairs for the
/// configured listener marks
pub struct PolicyRouting {
    program: String,
    route_table: u32,
    marks: Vec<u32>,
}

impl PolicyRouting {
    /// Create a policy-routing handle using `ip` from `PATH`
    #[must_use]
    pub fn new(route_table: u32, marks: Vec<u32>) -> Self {
        Self::with_program("ip", route_table, marks)
    }

    /// Create a handle using a specific `ip` binary
    #[must_use]
    pub fn with_program(program: impl Into<String>, route_table: u32, marks: Vec<u32>) -> Self {
        Self {
            program: program.into(),
            route_table,
            marks,
        }
    }

    /// Install the fwmark rules and loopback routes.
    ///
    /// Re-running against already-present rules is not an error.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::PolicyRouting` on the first failing command.
    pub async fn install(&self) -> Result<(), RouteError> {
        let table = self.route_table.to_string();
        for mark in &self.marks {
            let mark = format!("{mark:#x}");
            for family in ["-4", "-6"] {
                self.run(&[
                    family, "rule", "add", "fwmark", &mark, "table", &table,
                ])
                .await?;
            }
        }
        for family in ["-4", "-6"] {
            self.run(&[
                family, "route", "add", "local", "default", "dev", "lo", "table", &table,
            ])
            .await?;
        }
        debug!(
            "policy routing installed: {} mark rules, table {table}",
            self.marks.len()
        );
        Ok(())
    }

    /// Remove the rules and routes, best effort: every command is
    /// attempted and failures are logged rather than returned.
    pub async fn remove(&self) {
        let table = self.route_table.to_string();
        for family in ["-4", "-6"] {
            if let Err(e) = self
                .run(&[
                    family, "route", "del", "local", "default", "dev", "lo", "table", &table,
                ])
                .await
            {
                warn!("policy routing teardown: {e}");
            }
        }
        for mark in &self.marks {
            let mark = format!("{mark:#x}");
            for family in ["-4", "-6"] {
                if let Err(e) = self
                    .run(&[family, "rule", "del", "fwmark", &mark, "table", &table])
                    .await
                {
                    warn!("policy routing teardown: {e}");
                }
            }
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(), RouteError> {
        let output = Command::new(&self.program).args(args).output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        // `ip rule add` reports an already-present rule as EEXIST
        if stderr.contains("File exists") {
            return Ok(());
        }
        Err(RouteError::PolicyRouting {
            command: format!("{} {}", self.program, args.join(" ")),
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_succeeds_with_succeeding_commands() {
        let policy = PolicyRouting::with_program("true", 300, vec![0x20, 0x21]);
        policy.install().await.unwrap();
    }

    #[tokio::test]
    async fn test_install_surfaces_command_failure() {
        let policy = PolicyRouting::with_program("false", 300, vec![0x20]);
        let err = policy.install().await.unwrap_err();
        assert!(matches!(err, RouteError::PolicyRouting { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let policy = PolicyRouting::with_program("/nonexistent/ip", 300, vec![0x20]);
        let err = policy.install().await.unwrap_err();
        assert!(matches!(err, RouteError::IoError(_)));
    }

    #[tokio::test]
    async fn test_remove_is_best_effort() {
        // Failing commands must not panic or abort teardown
        let policy = PolicyRouting::with_program("false", 300, vec![0x20]);
        policy.remove().await;
    }
}
