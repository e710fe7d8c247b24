use serde::{Deserialize, Serialize};

// OCI Distribution Spec wire models

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

// Catalog response
#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub repositories: Vec<String>,
}

// Tags list response
#[derive(Debug, Serialize, Deserialize)]
pub struct TagsListResponse {
    pub name: String,
    pub tags: Vec<String>,
}
