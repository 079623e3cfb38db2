//! JSON bodies exchanged between the capture session and the append server.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

// ============================================================================
// Sessions and appends
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequest {
    pub session_id: String,
    pub project: String,
    pub chat_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponse {
    pub success: bool,
    pub project: String,
    pub chat_name: String,
    pub total_words: usize,
    pub project_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub project: String,
    #[serde(default)]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub new_content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<String>,
    #[serde(default)]
    pub content_length: usize,
    #[serde(default)]
    pub total_words: usize,
}

// ============================================================================
// Projects, search and stats
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub name: String,
    pub words: usize,
    pub chats: usize,
    pub files: usize,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectsResponse {
    pub projects: Vec<ProjectSummary>,
    pub total_projects: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub project: String,
    pub file: String,
    pub matches: Vec<String>,
    pub total_matches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub total_matches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFileStats {
    pub file: String,
    pub words: usize,
    pub chars: usize,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStats {
    pub project: String,
    pub total_words: usize,
    pub total_chars: usize,
    pub chat_count: usize,
    pub chats: Vec<ChatFileStats>,
    pub average_words_per_chat: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeWarning {
    pub project: String,
    pub file: String,
    pub size: u64,
    pub percent_of_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeError {
    pub project: String,
    pub file: String,
    pub size: u64,
    pub over_by: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeLimits {
    pub warning: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeReport {
    pub warnings: Vec<SizeWarning>,
    pub errors: Vec<SizeError>,
    pub limits: SizeLimits,
}
