//! The application side of the deployment protocol: the control messages exchanged with the
//!  cluster master, and [AppClient] which registers an application and keeps it registered.

mod app_client;
mod listener;
mod messages;

pub use app_client::{AppClient, RegistrationState, APP_CLIENT_ENDPOINT_NAME, MASTER_ENDPOINT_NAME};
pub use listener::AppClientListener;
#[cfg(test)] pub use listener::MockAppClientListener;
pub use messages::{ApplicationDescription, DeployMessage, ExecutorState};
