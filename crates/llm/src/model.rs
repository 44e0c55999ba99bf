use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub supports_reasoning: bool,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            supports_reasoning: false,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_reasoning(mut self) -> Self {
        self.supports_reasoning = true;
        self
    }
}

pub const DEFAULT_MODEL_TYPE: &str = "gpt-4o-mini";

pub fn default_models() -> Vec<Model> {
    vec![
        Model::from_id("gpt-4o-mini").with_description("Balanced cost/performance default"),
        Model::from_id("gpt-4o").with_description("High quality general model"),
        Model::from_id("deepseek-r1")
            .with_description("Streams a separate reasoning channel")
            .with_reasoning(),
        Model::from_id("o3")
            .with_description("Advanced reasoning model")
            .with_reasoning(),
    ]
}

/// Routing parameters sent alongside every prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub model_type: String,
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub reasoning: bool,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_TYPE)
    }
}

impl ModelParameters {
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            model_type: model_type.into(),
            web_search: false,
            reasoning: false,
        }
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    pub fn with_reasoning(mut self, enabled: bool) -> Self {
        self.reasoning = enabled;
        self
    }
}
