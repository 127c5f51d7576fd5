#[derive(Debug, thiserror::Error)]
pub enum CompositorError {
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    #[error("No backend is active")]
    NoBackend,

    #[error("Backend is already active")]
    BackendActive,

    #[error("Importing the root image failed: {0}")]
    RootImage(String),

    #[error("Presenting the frame failed: {0}")]
    Present(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BlurError {
    #[error("Blur is not supported by the {0} backend")]
    Unsupported(&'static str),

    #[error("Failed to allocate blur resources: {0}")]
    Allocation(String),

    #[error("Failed to build blur shader: {0}")]
    Shader(String),

    #[error("Invalid blur kernel: {0}")]
    InvalidKernel(String),
}
