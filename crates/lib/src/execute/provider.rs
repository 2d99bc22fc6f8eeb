//! Provider capability.
//!
//! The engine never talks to real infrastructure. Each resource type has a
//! provider that performs create, update and destroy, and declares the static
//! attribute policy table used by the differ.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::Attributes;
use crate::schema::{ResourceSchema, SchemaRegistry};

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
  /// Opaque identifier the provider uses for later calls.
  pub id: String,
  /// Attributes computed by the provider (addresses, ARNs, ...).
  pub attributes: Attributes,
}

impl Created {
  pub fn new(id: impl Into<String>, attributes: Attributes) -> Self {
    Self {
      id: id.into(),
      attributes,
    }
  }
}

/// Failure reported by a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
  #[error("{0}")]
  Message(String),

  #[error(transparent)]
  Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ProviderError {
  pub fn msg(message: impl Into<String>) -> Self {
    Self::Message(message.into())
  }
}

/// Performs the external effect of plan steps for one resource type.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use converge_lib::execute::{Created, ProviderError, ResourceProvider};
/// use converge_lib::resource::Attributes;
/// use converge_lib::schema::ResourceSchema;
///
/// struct NullProvider;
///
/// #[async_trait]
/// impl ResourceProvider for NullProvider {
///   fn schema(&self) -> ResourceSchema {
///     ResourceSchema::new("null_resource").force_new("trigger")
///   }
///
///   async fn create(&self, _attributes: &Attributes) -> Result<Created, ProviderError> {
///     Ok(Created::new("null-1", Attributes::new()))
///   }
///
///   async fn update(&self, _id: &str, _attributes: &Attributes) -> Result<Attributes, ProviderError> {
///     Ok(Attributes::new())
///   }
///
///   async fn destroy(&self, _id: &str) -> Result<(), ProviderError> {
///     Ok(())
///   }
/// }
/// ```
#[async_trait]
pub trait ResourceProvider: Send + Sync {
  /// Attribute policies for the type this provider manages.
  fn schema(&self) -> ResourceSchema;

  /// Create a resource from fully resolved attributes.
  async fn create(&self, attributes: &Attributes) -> Result<Created, ProviderError>;

  /// Change an existing resource in place. Returns computed attributes.
  async fn update(&self, id: &str, attributes: &Attributes) -> Result<Attributes, ProviderError>;

  async fn destroy(&self, id: &str) -> Result<(), ProviderError>;
}

/// Providers keyed by resource type.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
  providers: BTreeMap<String, Arc<dyn ResourceProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProviderRegistry")
      .field("types", &self.providers.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl ProviderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a provider under the type named by its schema.
  pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
    let resource_type = provider.schema().resource_type;
    self.providers.insert(resource_type, provider);
  }

  pub fn with(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
    self.register(provider);
    self
  }

  pub fn get(&self, resource_type: &str) -> Option<&Arc<dyn ResourceProvider>> {
    self.providers.get(resource_type)
  }

  /// Schema table built from every registered provider.
  pub fn schemas(&self) -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    for provider in self.providers.values() {
      registry.register(provider.schema());
    }
    registry
  }
}
