//! Device Classifier
//!
//! Sorts raw device bus events into pools. Rules are the configured pools in
//! declaration order; the first pool whose selector matches wins and devices
//! matching no pool are ignored.

use super::selector::Selector;
use crate::config::AgentConfig;
use crate::domain::{attr, Device, Health, RawEvent};
use crate::error::Result;
use tracing::trace;

// =============================================================================
// Pool Rules
// =============================================================================

/// One ordered classification rule
#[derive(Debug, Clone)]
struct PoolRule {
    pool: String,
    selector: Selector,
}

// =============================================================================
// Device Classifier
// =============================================================================

/// Maps raw events onto pool members
#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    rules: Vec<PoolRule>,
}

impl DeviceClassifier {
    /// Build the classifier from the configured pools
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let rules = config
            .pools
            .iter()
            .map(|pool| {
                Ok(PoolRule {
                    pool: pool.name.clone(),
                    selector: Selector::compile(&pool.selector)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Classify a raw event into a device of the first matching pool
    ///
    /// Pure: the result depends only on the event's attributes. Events
    /// without a subsystem, device path or device node never classify,
    /// since there is nothing to hand to a container.
    pub fn classify(&self, event: &RawEvent) -> Option<Device> {
        let id = event.device_id()?;
        event.get(attr::DEVNAME)?;

        let rule = self.rules.iter().find(|rule| rule.selector.matches(event))?;
        trace!("Device {} matched pool {}", id, rule.pool);

        Some(Device {
            id,
            pool: rule.pool.clone(),
            attributes: event.attributes.clone(),
            health: Health::Healthy,
        })
    }

    /// Pool names in classification order
    pub fn pools(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.pool.as_str())
    }
}
