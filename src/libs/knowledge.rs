use serde::{Deserialize, Serialize};

pub const MAX_KNOWLEDGE_TEXT_LEN: usize = 20_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Knowledge {
    pub id: String,
    pub project_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_ms: i64,
    pub updated_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgePatch {
    pub text: Option<String>,
    pub domain: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl KnowledgePatch {
    pub fn apply_to(&self, knowledge: &Knowledge) -> Knowledge {
        let mut next = knowledge.clone();
        if let Some(text) = &self.text {
            next.text = text.clone();
        }
        if let Some(domain) = &self.domain {
            next.domain = Some(domain.clone());
        }
        if let Some(tags) = &self.tags {
            next.tags = tags.clone();
        }
        next
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeFilter {
    pub project_id: Option<String>,
    pub domain: Option<String>,
    pub tag: Option<String>,
}
