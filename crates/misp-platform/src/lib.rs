//! MISP Platform: container runtime and REST collaborators for the installer
//!
//! The installer core never shells out or speaks HTTP itself. Phase bodies
//! reach the outside world through the two traits defined here:
//!
//! - [`ContainerRuntime`]: start/stop/inspect services of the Docker
//!   Compose project ([`ComposeRunner`]).
//! - [`PlatformApi`]: the subset of the MISP REST API the installer needs
//!   ([`MispClient`]).

pub mod compose;
pub mod error;
pub mod fakes;
pub mod misp;

pub use compose::{ComposeConfig, ComposeRunner, ContainerRuntime, ExecOutput, ServiceHealth};
pub use error::PlatformError;
pub use misp::{ApiKeySource, FeedSummary, MispClient, MispConfig, NewFeed, PlatformApi};

/// Result type for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;
