pub mod collaborator;
pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod models;

pub use collaborator::{
    ask, create_collaborator, decode_response, ClientConfig, Collaborator, CollaboratorError,
    DisabledCollaborator, HttpCollaborator,
};
pub use config::TraceryConfig;
pub use error::{SessionError, TraceryError};
