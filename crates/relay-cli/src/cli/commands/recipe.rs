//! Recipe command handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use relay_core::config::paths;
use relay_core::core::recipe_gate::{
    self, FileAcceptanceStore, RecipeGate, RecipeOrigin, UnicodeTagScanner,
};
use relay_core::recipe::Recipe;

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

pub async fn check(file: &Path, params: &[String]) -> Result<()> {
    let recipe = Recipe::from_file(file)?;
    let given = recipe_gate::parse_parameter_pairs(params.iter().map(String::as_str))?;
    let values = recipe_gate::resolve_parameters(recipe.declared_parameters(), &given);

    let gate = RecipeGate::new(
        Arc::new(UnicodeTagScanner),
        Arc::new(FileAcceptanceStore::new(paths::recipe_hashes_dir())),
    );
    let evaluation = gate.evaluate(&recipe, RecipeOrigin::Loaded).await?;

    let used: Vec<String> = evaluation
        .used_parameters
        .iter()
        .map(|p| p.key.clone())
        .collect();
    let missing = recipe_gate::missing_parameters(&evaluation.used_parameters, &values);

    println!("Recipe: {} ({})", recipe.title, recipe.version);
    println!("Used parameters: {}", join_or_none(&used));
    println!("Missing parameters: {}", join_or_none(&missing));
    println!(
        "Accepted: {}",
        if evaluation.accepted { "yes" } else { "no" }
    );
    if evaluation.has_security_warnings() {
        for warning in evaluation.warnings() {
            println!("Warning: {}", warning.message);
        }
    }
    Ok(())
}

pub fn render(file: &Path, params: &[String]) -> Result<()> {
    let recipe = Recipe::from_file(file)?;
    let given = recipe_gate::parse_parameter_pairs(params.iter().map(String::as_str))?;

    let Some(prompt) = recipe_gate::initial_prompt(&recipe, &given) else {
        anyhow::bail!("Recipe '{}' has no prompt", recipe.title);
    };

    let values = recipe_gate::resolve_parameters(recipe.declared_parameters(), &given);
    let used = recipe_gate::filter_used_parameters(
        recipe.declared_parameters(),
        recipe_gate::TemplateSources::of(&recipe),
    );
    let missing = recipe_gate::missing_parameters(&used, &values);
    if !missing.is_empty() {
        eprintln!("Missing parameters: {}", missing.join(", "));
    }

    println!("{prompt}");
    Ok(())
}
