use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VemuError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("no base image '{name}' registered for architecture '{arch}'")]
    #[diagnostic(help("known images: {known}"))]
    UnknownImage {
        name: String,
        arch: String,
        known: String,
    },

    #[error("unsupported network mode '{mode}'")]
    #[diagnostic(help("supported modes are 'tap' and 'user'"))]
    UnsupportedNetworkMode { mode: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status}): {stderr}")]
    ExternalCommand {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("differential disk missing at {path} after `{command}` reported success")]
    DiskCreationVerificationFailed { path: String, command: String },

    #[error("seed disk authoring failed (`{command}`): {message}")]
    SeedAuthoringFailed { command: String, message: String },

    #[error("failed to render {message}")]
    Render { message: String },

    #[error("state record error: {message}")]
    State { message: String },

    #[error("image download failed: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("failed to exec `{command}`")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
