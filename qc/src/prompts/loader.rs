//! Prompt Loader
//!
//! Loads prompt templates from files or falls back to embedded defaults.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::embedded;

/// Context for rendering the query-generation prompt
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryPromptContext {
    /// Product category path, e.g. "Books > Literature & Fiction"
    pub category: Option<String>,
    /// Adds the book-title guidance
    pub is_books: bool,
}

impl QueryPromptContext {
    pub fn for_category(category: Option<&str>) -> Self {
        let category = category.map(str::trim).filter(|c| !c.is_empty());
        Self {
            is_books: category.is_some_and(|c| c.starts_with("Books")),
            category: category.map(str::to_string),
        }
    }
}

/// Prompt loader with template caching
pub struct PromptLoader {
    hbs: Handlebars<'static>,
    user_dir: Option<PathBuf>,
    repo_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a loader rooted at `root`
    ///
    /// Looks for overrides in `.querycurate/prompts/` and `prompts/` under
    /// the root before using the embedded templates.
    pub fn new(root: &Path) -> Self {
        debug!(?root, "PromptLoader::new: called");
        let user_dir = root.join(".querycurate/prompts");
        let repo_dir = root.join("prompts");

        Self {
            hbs: Self::handlebars(),
            user_dir: user_dir.exists().then_some(user_dir),
            repo_dir: repo_dir.exists().then_some(repo_dir),
        }
    }

    /// Create a loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        debug!("PromptLoader::embedded_only: called");
        Self {
            hbs: Self::handlebars(),
            user_dir: None,
            repo_dir: None,
        }
    }

    fn handlebars() -> Handlebars<'static> {
        let mut hbs = Handlebars::new();
        // Prompts are plain text, not HTML
        hbs.register_escape_fn(handlebars::no_escape);
        hbs
    }

    /// Load a template by name
    ///
    /// Checks in order:
    /// 1. User override: `.querycurate/prompts/{name}.pmt`
    /// 2. Repo default: `prompts/{name}.pmt`
    /// 3. Embedded fallback
    fn load_template(&self, name: &str) -> Result<String> {
        debug!(%name, "PromptLoader::load_template: called");
        for dir in [&self.user_dir, &self.repo_dir].into_iter().flatten() {
            let path = dir.join(format!("{}.pmt", name));
            if path.exists() {
                debug!(?path, "PromptLoader::load_template: found on disk");
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read prompt {}: {}", path.display(), e));
            }
        }

        if let Some(content) = embedded::get_embedded(name) {
            debug!(%name, "PromptLoader::load_template: found in embedded");
            return Ok(content.to_string());
        }

        Err(eyre!("Prompt template not found: {}", name))
    }

    /// Render a template with the given context
    pub fn render<C: Serialize>(&self, template_name: &str, context: &C) -> Result<String> {
        debug!(%template_name, "PromptLoader::render: called");
        let template = self.load_template(template_name)?;
        self.hbs
            .render_template(&template, context)
            .map_err(|e| eyre!("Failed to render template {}: {}", template_name, e))
    }

    /// Render the query-generation system prompt for a product category
    pub fn query_prompt(&self, category: Option<&str>) -> Result<String> {
        debug!(?category, "PromptLoader::query_prompt: called");
        self.render("query", &QueryPromptContext::for_category(category))
    }
}
