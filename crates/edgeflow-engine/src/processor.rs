use edgeflow_core::error::Result;
use edgeflow_core::types::Relationship;

use crate::context::ProcessContext;
use crate::session::{ProcessSession, SessionFactory};

/// A configuration key a processor understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub description: String,
    pub default: Option<String>,
    pub required: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: None,
            required: false,
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// What a processor declares about itself once, at registration.
#[derive(Debug, Clone, Default)]
pub struct ProcessorDescriptor {
    /// Implementation name, reported as the component type in provenance.
    pub type_name: String,
    pub properties: Vec<PropertyDescriptor>,
    pub relationships: Vec<Relationship>,
}

impl ProcessorDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    pub fn property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn has_relationship(&self, name: &str) -> bool {
        self.relationships.iter().any(|r| r.name == name)
    }
}

/// Processing unit hosted by the engine.
///
/// Trigger code is synchronous and runs on a blocking worker thread. A
/// processor configured for N concurrent tasks may see N simultaneous
/// `on_trigger` calls, each with its own session.
pub trait Processor: Send + Sync + 'static {
    /// Declare supported properties and relationships.
    fn initialize(&self) -> ProcessorDescriptor;

    /// One-time setup when scheduling starts. An error leaves the processor
    /// unscheduled.
    fn on_schedule(&self, ctx: &ProcessContext, factory: &SessionFactory) -> Result<()> {
        let _ = (ctx, factory);
        Ok(())
    }

    /// Do one unit of work. Returning an error rolls the session back and
    /// makes the processor yield.
    fn on_trigger(&self, ctx: &ProcessContext, session: &mut ProcessSession) -> Result<()>;

    /// Best-effort cleanup on shutdown.
    fn notify_stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builders() {
        let descriptor = ProcessorDescriptor::new("Split")
            .property(PropertyDescriptor::new("Delimiter", "Split on").with_default("\n"))
            .property(PropertyDescriptor::new("Target", "Where").required())
            .relationship(Relationship::success());

        assert_eq!(descriptor.type_name, "Split");
        assert_eq!(descriptor.properties[0].default.as_deref(), Some("\n"));
        assert!(descriptor.properties[1].required);
        assert!(descriptor.has_relationship("success"));
        assert!(!descriptor.has_relationship("failure"));
    }
}
