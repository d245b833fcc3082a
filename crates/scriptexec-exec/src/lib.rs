//! scriptexec-exec: Script runners
//!
//! Runs a [`Script`](scriptexec_script::Script) either as a local process or
//! over an SSH session, behind one [`Runner`] contract.

pub mod connection;
pub mod error;
pub mod known_hosts;
pub mod local;
pub mod runner;
pub mod ssh;
pub mod stream;
pub mod traits;

pub use connection::{Connection, LocalConnection, SshConnection};
pub use error::RunnerError;
pub use runner::{RunOutput, new, run};
pub use stream::{BoxedWriter, SharedBuffer};
pub use traits::{Runner, RunnerState};
