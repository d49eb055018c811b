use serde::{Deserialize, Serialize};

/// Descriptor for one chapter whose page list must be looked up
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterResolutionRequest {
    /// Title segment of the chapter endpoint, e.g. `7965--chainsaw-man`
    pub title_slug: String,
    pub chapter_id: Option<String>,
    pub volume: Option<i64>,
    pub number: Option<f64>,
    pub branch_id: Option<i64>,
    /// Branch the title serves when no branch filter is given
    pub default_branch_id: Option<i64>,
}

impl ChapterResolutionRequest {
    pub fn new(title_slug: impl Into<String>) -> Self {
        Self {
            title_slug: title_slug.into(),
            ..Default::default()
        }
    }

    pub fn with_chapter_id(mut self, chapter_id: impl Into<String>) -> Self {
        self.chapter_id = Some(chapter_id.into());
        self
    }

    pub fn with_number(mut self, number: f64) -> Self {
        self.number = Some(number);
        self
    }

    pub fn with_volume(mut self, volume: i64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_branch(mut self, branch_id: i64, default_branch_id: Option<i64>) -> Self {
        self.branch_id = Some(branch_id);
        self.default_branch_id = default_branch_id;
        self
    }

    /// Label used in log lines and errors
    pub fn label(&self) -> String {
        match (&self.chapter_id, self.number) {
            (Some(id), _) => format!("{}#{}", self.title_slug, id),
            (None, Some(number)) => format!("{}@{}", self.title_slug, number),
            (None, None) => self.title_slug.clone(),
        }
    }
}

/// One page image produced by chapter resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAsset {
    /// 1-based page position
    pub index: usize,
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}
