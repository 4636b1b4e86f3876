//! # Recipes
//!
//! A recipe is a named, versioned template that attaches domain behaviour to
//! one of the five primitives. Expansion happens once, when a topology is
//! wired: the library is looked up by name, the template is instantiated with
//! the component's config, and traits and contracts are applied. The result
//! is a plain [`Component`](crate::component::Component); nothing of the
//! recipe survives into the running graph except its [`Provenance`].
//!
//! ```rust,no_run
//! use portweave::recipe::{RecipeExpander, RecipeLibrary};
//! use serde_json::json;
//!
//! let library = RecipeLibrary::with_builtins();
//! let expander = RecipeExpander::new(&library);
//! let component = expander.expand("numbers", "range_source", &json!({"end": 100}))?;
//! # Ok::<(), portweave::error::ExpansionError>(())
//! ```

mod builtin;
mod expander;

#[cfg(test)]
mod expander_test;

pub use expander::RecipeExpander;

use crate::component::{Primitive, Shape};
use crate::error::{BodyError, ExpansionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Version given to the built-in recipes.
pub const BUILTIN_VERSION: &str = "1.0.0";

/// Behaviour a recipe attaches to its primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeTrait {
  /// Transformer only: a checkpointed key/value store reachable through
  /// [`ComponentContext::store`](crate::component::ComponentContext::store).
  Persistent,
  /// Any shape. Per-port FIFO already holds, so this only documents intent.
  Ordered,
  /// Merger only: a bounded accumulation buffer of `window_size` items.
  Windowed,
}

impl RecipeTrait {
  /// Whether the trait can be attached to `shape`.
  pub fn applies_to(self, shape: Shape) -> bool {
    match self {
      RecipeTrait::Persistent => shape == Shape::Transformer,
      RecipeTrait::Windowed => shape == Shape::Merger,
      RecipeTrait::Ordered => true,
    }
  }
}

impl fmt::Display for RecipeTrait {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      RecipeTrait::Persistent => "persistent",
      RecipeTrait::Ordered => "ordered",
      RecipeTrait::Windowed => "windowed",
    })
  }
}

/// Delivery or purity guarantee a recipe declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contract {
  /// Routing depends only on the item and the body state.
  Deterministic,
  /// Side effects are guarded by the idempotency store.
  Idempotent,
  /// Default delivery contract.
  AtLeastOnce,
}

impl fmt::Display for Contract {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Contract::Deterministic => "deterministic",
      Contract::Idempotent => "idempotent",
      Contract::AtLeastOnce => "at_least_once",
    })
  }
}

/// Builds a body from a component's config. Implemented by the generation
/// layer for generated bodies; any matching closure works.
pub trait BodyFactory: Send + Sync {
  /// Instantiates the body.
  fn instantiate(&self, config: &Value) -> Result<Primitive, BodyError>;
}

impl<F> BodyFactory for F
where
  F: Fn(&Value) -> Result<Primitive, BodyError> + Send + Sync,
{
  fn instantiate(&self, config: &Value) -> Result<Primitive, BodyError> {
    self(config)
  }
}

/// Where a recipe's body comes from.
#[derive(Clone)]
pub enum BodyTemplate {
  /// One of the templates shipped with the crate.
  Builtin(fn(&Value) -> Result<Primitive, BodyError>),
  /// A body supplied by the generation layer.
  Generated(Arc<dyn BodyFactory>),
}

impl BodyTemplate {
  /// Wraps a generated body factory.
  pub fn generated(factory: impl BodyFactory + 'static) -> Self {
    BodyTemplate::Generated(Arc::new(factory))
  }

  pub(crate) fn instantiate(&self, config: &Value) -> Result<Primitive, BodyError> {
    match self {
      BodyTemplate::Builtin(build) => build(config),
      BodyTemplate::Generated(factory) => factory.instantiate(config),
    }
  }
}

impl fmt::Debug for BodyTemplate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BodyTemplate::Builtin(_) => f.write_str("BodyTemplate::Builtin"),
      BodyTemplate::Generated(_) => f.write_str("BodyTemplate::Generated"),
    }
  }
}

/// A named, versioned template.
#[derive(Debug, Clone)]
pub struct Recipe {
  name: String,
  version: String,
  base_shape: Shape,
  traits: Vec<RecipeTrait>,
  contracts: Vec<Contract>,
  body_template: BodyTemplate,
}

impl Recipe {
  /// Creates a recipe with no traits and no contracts.
  ///
  /// # Arguments
  ///
  /// * `name` - Name components refer to in a topology
  /// * `version` - Recorded in the provenance of every expansion
  /// * `base_shape` - Shape the template must produce
  /// * `body_template` - Source of the body
  pub fn new(
    name: impl Into<String>,
    version: impl Into<String>,
    base_shape: Shape,
    body_template: BodyTemplate,
  ) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      base_shape,
      traits: Vec::new(),
      contracts: Vec::new(),
      body_template,
    }
  }

  /// Adds a trait.
  pub fn with_trait(mut self, recipe_trait: RecipeTrait) -> Self {
    if !self.traits.contains(&recipe_trait) {
      self.traits.push(recipe_trait);
    }
    self
  }

  /// Adds a contract.
  pub fn with_contract(mut self, contract: Contract) -> Self {
    if !self.contracts.contains(&contract) {
      self.contracts.push(contract);
    }
    self
  }

  /// Recipe name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Recipe version.
  pub fn version(&self) -> &str {
    &self.version
  }

  /// Shape the recipe expands to.
  pub fn base_shape(&self) -> Shape {
    self.base_shape
  }

  /// Attached traits.
  pub fn traits(&self) -> &[RecipeTrait] {
    &self.traits
  }

  /// Declared contracts.
  pub fn contracts(&self) -> &[Contract] {
    &self.contracts
  }

  /// Body source.
  pub fn body_template(&self) -> &BodyTemplate {
    &self.body_template
  }

  /// Whether `recipe_trait` is attached.
  pub fn has_trait(&self, recipe_trait: RecipeTrait) -> bool {
    self.traits.contains(&recipe_trait)
  }

  /// Whether `contract` is declared.
  pub fn has_contract(&self, contract: Contract) -> bool {
    self.contracts.contains(&contract)
  }

  /// Provenance stamped on components expanded from this recipe.
  pub fn provenance(&self) -> Provenance {
    Provenance {
      recipe: self.name.clone(),
      version: self.version.clone(),
    }
  }
}

/// Which recipe produced a component. Diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
  /// Recipe name.
  pub recipe: String,
  /// Recipe version.
  pub version: String,
}

impl fmt::Display for Provenance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.recipe, self.version)
  }
}

/// Table of recipes keyed by name.
#[derive(Debug, Clone, Default)]
pub struct RecipeLibrary {
  recipes: BTreeMap<String, Recipe>,
}

impl RecipeLibrary {
  /// Empty library.
  pub fn new() -> Self {
    Self::default()
  }

  /// Library holding every built-in recipe.
  pub fn with_builtins() -> Self {
    let mut library = Self::new();
    for recipe in builtin::recipes() {
      library.recipes.insert(recipe.name.clone(), recipe);
    }
    library
  }

  /// Adds a recipe. Names are unique.
  pub fn register(&mut self, recipe: Recipe) -> Result<(), ExpansionError> {
    if self.recipes.contains_key(&recipe.name) {
      return Err(ExpansionError::DuplicateRecipe(recipe.name));
    }
    self.recipes.insert(recipe.name.clone(), recipe);
    Ok(())
  }

  /// Looks a recipe up.
  pub fn get(&self, name: &str) -> Option<&Recipe> {
    self.recipes.get(name)
  }

  /// Registered recipe names, sorted.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.recipes.keys().map(String::as_str)
  }

  /// Number of recipes.
  pub fn len(&self) -> usize {
    self.recipes.len()
  }

  /// Whether the library is empty.
  pub fn is_empty(&self) -> bool {
    self.recipes.is_empty()
  }
}
