use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("manifest document {doc}: {source}")]
    Yaml { doc: usize, source: serde_yaml::Error },
    #[error("manifest document {doc} is missing {field}")]
    MissingField { doc: usize, field: &'static str },
    #[error("manifests too large (>{limit} bytes)")]
    TooLarge { limit: usize },
    #[error("manifest document {doc} too complex (>{limit} nodes)")]
    TooComplex { doc: usize, limit: usize },
    #[error("resource {0} appears more than once")]
    DuplicateResource(String),
    #[error("namespace required for namespaced kind {kind} ({name})")]
    NamespaceRequired { kind: String, name: String },
    #[error("release {key} has no recorded revision {revision}")]
    UnknownRevision { key: String, revision: u32 },
}
