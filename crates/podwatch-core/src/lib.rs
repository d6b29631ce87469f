pub mod basecaller;
pub mod config;
pub mod error;
pub mod index;
pub mod mailer;
pub mod paths;
pub mod pipeline;
pub mod resolver;
pub mod types;
pub mod watch;

pub use error::{PodwatchError, Result};
