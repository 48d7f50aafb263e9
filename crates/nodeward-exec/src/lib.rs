//! Local execution primitives for the nodeward agent.
//!
//! - [`runner`]: launch one child process and capture its output while it runs
//! - [`privilege`]: account lookup, ownership changes and `su` wrapping
//! - [`env`]: decoding of environment payloads sent with a command
//! - [`engine`]: `execute_command` / `execute_file` on top of the runner
//! - [`packages`]: distribution detection and package installation
//! - [`facts`]: the env-sourcing file and the machine-readable facts file
//! - [`fsutil`]: permission helper used before executing files
//!
//! Process failures are never returned as `Err`: they are encoded in the
//! [`ExecutionResult`] exit code and stderr text. Only policy decisions with no
//! safe default (an unknown distribution, an unknown account) produce errors.

pub mod ansi;
pub mod engine;
pub mod env;
pub mod facts;
pub mod fsutil;
pub mod packages;
pub mod privilege;
pub mod runner;

pub use engine::{CommandLine, ExecutionEngine, ExecutionRequest};
pub use env::{decode_env_payload, merged_environment};
pub use facts::{FactsError, FactsPaths, write_env_file, write_facts_file};
pub use nodeward_protocol::ExecutionResult;
pub use packages::{Distribution, PackageError, install_packages};
pub use privilege::{PrivilegeError, chown_tree, resolve_group, resolve_user, run_as};
pub use runner::{ProcessRunner, ProcessSpec, RunOptions};
