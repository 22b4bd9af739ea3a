//! Recipe model: a parameterized, reusable task template.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::extension::ExtensionConfig;

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParameterInputType {
    #[default]
    String,
    Number,
    Boolean,
    Date,
    /// Content imported from a file path. Never carries a default.
    File,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParameterRequirement {
    #[default]
    Required,
    Optional,
    UserPrompt,
}

impl fmt::Display for ParameterRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParameterRequirement::Required => "required",
            ParameterRequirement::Optional => "optional",
            ParameterRequirement::UserPrompt => "user_prompt",
        })
    }
}

/// A named template variable declared by a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeParameter {
    pub key: String,
    #[serde(default)]
    pub input_type: ParameterInputType,
    #[serde(default)]
    pub requirement: ParameterRequirement,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl RecipeParameter {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            input_type: ParameterInputType::default(),
            requirement: ParameterRequirement::default(),
            description: String::new(),
            default: None,
            options: None,
        }
    }

    /// Only `required` parameters block a conversation.
    pub fn is_required(&self) -> bool {
        self.requirement == ParameterRequirement::Required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default = "default_version")]
    pub version: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<ExtensionConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<RecipeParameter>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_execution: bool,
}

impl Recipe {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            title: title.into(),
            description: description.into(),
            instructions: None,
            prompt: None,
            extensions: None,
            context: None,
            activities: None,
            author: None,
            parameters: None,
            is_scheduled_execution: false,
        }
    }

    /// Loads a recipe from a YAML or JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid recipe {}", path.display()))
    }

    /// Parses YAML (and therefore JSON) recipe text and validates it.
    pub fn parse(contents: &str) -> Result<Self> {
        let recipe: Recipe =
            serde_yaml::from_str(contents).context("Failed to parse recipe")?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instructions.is_none() && self.prompt.is_none() {
            bail!("Recipe must set instructions or prompt");
        }
        for param in self.declared_parameters() {
            if param.input_type == ParameterInputType::File && param.default.is_some() {
                bail!("File parameter '{}' cannot have a default value", param.key);
            }
        }
        Ok(())
    }

    pub fn declared_parameters(&self) -> &[RecipeParameter] {
        self.parameters.as_deref().unwrap_or_default()
    }

    /// Recipe-bound extensions, or `None` when the recipe does not pin any.
    pub fn pinned_extensions(&self) -> Option<&[ExtensionConfig]> {
        self.extensions.as_deref().filter(|e| !e.is_empty())
    }

    /// Hex SHA-256 of the recipe's canonical JSON form.
    ///
    /// Identical recipe content always hashes the same, which is what
    /// acceptance records are keyed by.
    pub fn content_hash(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self).context("Failed to serialize recipe")?;
        let digest = Sha256::digest(&canonical);
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
title: Translator
description: Translates text
prompt: "Write in {{ lang }}"
parameters:
  - key: lang
    input_type: string
    requirement: required
    description: Target language
extensions:
  - name: developer
    type: builtin
"#;

    #[test]
    fn test_parse_yaml_recipe() {
        let recipe = Recipe::parse(YAML).unwrap();

        assert_eq!(recipe.version, "1.0.0");
        assert_eq!(recipe.declared_parameters().len(), 1);
        assert!(recipe.declared_parameters()[0].is_required());
        let mut prompted = RecipeParameter::new("topic");
        prompted.requirement = ParameterRequirement::UserPrompt;
        assert!(!prompted.is_required());
        assert_eq!(recipe.pinned_extensions().unwrap()[0].name, "developer");
    }

    #[test]
    fn test_parse_json_recipe() {
        let recipe = Recipe::parse(
            r#"{"title": "t", "description": "d", "instructions": "do it"}"#,
        )
        .unwrap();
        assert_eq!(recipe.instructions.as_deref(), Some("do it"));
        assert!(recipe.declared_parameters().is_empty());
    }

    #[test]
    fn test_recipe_without_prompt_or_instructions_is_rejected() {
        let err = Recipe::parse("title: t\ndescription: d\n").unwrap_err();
        assert!(format!("{err:#}").contains("instructions or prompt"));
    }

    #[test]
    fn test_file_parameter_with_default_is_rejected() {
        let yaml = r"
title: t
description: d
prompt: read {{ path }}
parameters:
  - key: path
    input_type: file
    default: /etc/passwd
";
        assert!(Recipe::parse(yaml).is_err());
    }

    #[test]
    fn test_content_hash_tracks_content() {
        let a = Recipe::parse(YAML).unwrap();
        let b = Recipe::parse(YAML).unwrap();
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert_eq!(a.content_hash().unwrap().len(), 64);

        let mut c = a.clone();
        c.prompt = Some("Write in {{ lang }}!".to_string());
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }
}
