//! Recipe expansion: table lookup plus template instantiation.

use super::{Contract, Recipe, RecipeLibrary, RecipeTrait};
use crate::checkpoint::IdempotencyStore;
use crate::component::{Component, KvStore, Shape, WindowBuffer};
use crate::error::ExpansionError;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Turns `(recipe, config)` into a concrete [`Component`].
///
/// The expander borrows the library; nothing it returns refers back to it.
pub struct RecipeExpander<'a> {
  library: &'a RecipeLibrary,
  idempotency: Option<Arc<dyn IdempotencyStore>>,
}

impl<'a> RecipeExpander<'a> {
  /// Expander over `library` with no idempotency store.
  pub fn new(library: &'a RecipeLibrary) -> Self {
    Self {
      library,
      idempotency: None,
    }
  }

  /// Store attached to components whose recipe is `idempotent`.
  pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
    self.idempotency = Some(store);
    self
  }

  /// Expands `recipe` into a component called `name`.
  ///
  /// # Errors
  ///
  /// - [`ExpansionError::UnknownRecipe`] if the library has no such recipe
  /// - [`ExpansionError::TraitNotApplicable`] for a trait the base shape
  ///   cannot carry
  /// - [`ExpansionError::NonDeterministicRouting`] for a Splitter recipe
  ///   without the `deterministic` contract
  /// - [`ExpansionError::MissingIdempotencyStore`] for an `idempotent` recipe
  ///   when no store was supplied
  /// - [`ExpansionError::InvalidConfig`] if the template rejects `config`
  /// - [`ExpansionError::ShapeMismatch`] if the template produced another
  ///   primitive
  /// - [`ExpansionError::Component`] if the declared ports break the shape
  ///   invariant
  pub fn expand(&self, name: &str, recipe: &str, config: &Value) -> Result<Component, ExpansionError> {
    let recipe = self
      .library
      .get(recipe)
      .ok_or_else(|| ExpansionError::UnknownRecipe(recipe.to_string()))?;
    self.check_rules(recipe)?;
    let window = window_size(recipe, config)?;

    let primitive = recipe
      .body_template()
      .instantiate(config)
      .map_err(|e| ExpansionError::config(recipe.name(), e))?;
    if primitive.shape() != recipe.base_shape() {
      return Err(ExpansionError::ShapeMismatch {
        recipe: recipe.name().to_string(),
        expected: recipe.base_shape(),
        actual: primitive.shape(),
      });
    }

    let mut component = Component::new(name, primitive)?;
    component.ensure_error_port()?;
    if recipe.has_trait(RecipeTrait::Persistent) {
      component.attach_store(KvStore::new());
    }
    if let Some(size) = window {
      component.attach_window(WindowBuffer::new(size));
    }
    if recipe.has_contract(Contract::Idempotent) {
      if let Some(store) = &self.idempotency {
        component.attach_idempotency(Arc::clone(store));
      }
    }
    component.set_config(config.clone());
    component.set_provenance(recipe.provenance());

    debug!(
      component = name,
      recipe = recipe.name(),
      version = recipe.version(),
      shape = %recipe.base_shape(),
      "expanded recipe"
    );
    Ok(component)
  }

  fn check_rules(&self, recipe: &Recipe) -> Result<(), ExpansionError> {
    let shape = recipe.base_shape();
    if let Some(&recipe_trait) = recipe.traits().iter().find(|t| !t.applies_to(shape)) {
      return Err(ExpansionError::TraitNotApplicable {
        recipe: recipe.name().to_string(),
        recipe_trait,
        shape,
      });
    }
    if shape == Shape::Splitter && !recipe.has_contract(Contract::Deterministic) {
      return Err(ExpansionError::NonDeterministicRouting(recipe.name().to_string()));
    }
    if recipe.has_contract(Contract::Idempotent) && self.idempotency.is_none() {
      return Err(ExpansionError::MissingIdempotencyStore(recipe.name().to_string()));
    }
    Ok(())
  }
}

fn window_size(recipe: &Recipe, config: &Value) -> Result<Option<usize>, ExpansionError> {
  if !recipe.has_trait(RecipeTrait::Windowed) {
    return Ok(None);
  }
  match config.get("window_size").and_then(Value::as_u64) {
    Some(size) if size >= 1 => usize::try_from(size)
      .map(Some)
      .map_err(|_| ExpansionError::config(recipe.name(), "window_size is too large")),
    _ => Err(ExpansionError::config(
      recipe.name(),
      "windowed recipes need an integer window_size of at least 1",
    )),
  }
}
