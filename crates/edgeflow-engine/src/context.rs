use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use edgeflow_core::config::SchedulingConfig;
use edgeflow_core::error::{FlowError, Result};
use edgeflow_core::event::EventBus;
use edgeflow_core::traits::Clock;
use edgeflow_core::types::{FlowEvent, ProcessorId};

use crate::node::ProcessorState;
use crate::processor::PropertyDescriptor;
use crate::record::Record;

/// Read-only view of a processor's configuration during scheduling and
/// triggering, plus the ability to yield.
pub struct ProcessContext {
    id: ProcessorId,
    name: String,
    type_name: String,
    properties: BTreeMap<String, String>,
    descriptors: Vec<PropertyDescriptor>,
    scheduling: SchedulingConfig,
    state: Arc<ProcessorState>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl ProcessContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ProcessorId,
        name: String,
        type_name: String,
        properties: BTreeMap<String, String>,
        descriptors: Vec<PropertyDescriptor>,
        scheduling: SchedulingConfig,
        state: Arc<ProcessorState>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            id,
            name,
            type_name,
            properties,
            descriptors,
            scheduling,
            state,
            clock,
            events,
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn scheduling(&self) -> &SchedulingConfig {
        &self.scheduling
    }

    /// Configured value, or the declared default.
    pub fn property(&self, name: &str) -> Option<String> {
        if let Some(value) = self.properties.get(name) {
            return Some(value.clone());
        }
        self.descriptors
            .iter()
            .find(|d| d.name == name)
            .and_then(|d| d.default.clone())
    }

    /// Property value with `${attribute}` references resolved against `record`.
    /// Unknown attributes expand to the empty string.
    pub fn property_for(&self, name: &str, record: &Record) -> Option<String> {
        self.property(name).map(|value| expand_attributes(&value, record))
    }

    pub fn required_property(&self, name: &str) -> Result<String> {
        self.property(name).ok_or_else(|| FlowError::MissingProperty {
            processor: self.name.clone(),
            property: name.to_string(),
        })
    }

    /// Parse a property into `T`. `Ok(None)` when it is unset with no default.
    pub fn parse_property<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.property(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| FlowError::InvalidProperty {
                property: name.to_string(),
                message: format!("'{}': {}", raw, e),
            }),
        }
    }

    /// Check that every required property has a value.
    pub(crate) fn validate(&self) -> Result<()> {
        for descriptor in self.descriptors.iter().filter(|d| d.required) {
            self.required_property(&descriptor.name)?;
        }
        Ok(())
    }

    /// Step out of scheduling for the configured yield period.
    pub fn yield_processor(&self) {
        let until = self.clock.now_millis() + self.scheduling.yield_period_ms;
        self.state.set_yield_until(until);
        debug!(processor = %self.name, until, "Processor yielding");
        self.events.publish(FlowEvent::ProcessorYielded {
            processor: self.name.clone(),
            until_millis: until,
        });
    }

    pub fn is_yielding(&self) -> bool {
        self.state.is_yielding(self.clock.now_millis())
    }
}

fn expand_attributes(input: &str, record: &Record) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut key = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                key.push(c);
            }
            if closed {
                result.push_str(record.attribute(key.trim()).unwrap_or_default());
            } else {
                result.push_str("${");
                result.push_str(&key);
            }
        } else {
            result.push(c);
        }
    }
    result
}
